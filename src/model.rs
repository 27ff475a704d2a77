//! Core data model: `JobRecord`, `CatalogUrl`, `CacheEntry`, `Checkpoint`, `SessionResult`.
//!
//! Grounded on the shape of the teacher's `page_extractor/schema.rs` typed records
//! (one concrete struct per logical entity, `Option` for fields that may be absent,
//! `chrono::DateTime<Utc>` timestamps, `serde` derives throughout) but retargeted at
//! job postings instead of crawled web pages, per spec.md §3.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque stable identifier for a logical posting: first 16 bytes of an xxh3-128
/// hash of the canonicalized `{title, company, url-path}` triple.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(#[serde(with = "hex_bytes")] pub [u8; 16]);

impl Fingerprint {
    #[must_use]
    pub fn from_u128(v: u128) -> Self {
        Self(v.to_be_bytes())
    }

    #[must_use]
    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.as_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("fingerprint must be 16 bytes"))
    }
}

/// Known tracking query parameters stripped during canonicalization (spec.md §3).
const TRACKING_PARAMS: &[&str] =
    &["utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content", "gclid", "fbclid", "msclkid", "mc_cid", "mc_eid", "ref", "ref_src"];

/// Canonicalizes an absolute job-listing URL per spec.md §3: lowercases the scheme,
/// drops the fragment, and strips known tracking query parameters. Falls back to
/// `raw` verbatim if it doesn't parse as a URL (grounded on `fetcher::paged_url`'s
/// same parse-or-fall-back-to-the-original-string shape).
#[must_use]
pub fn canonicalize_url(raw: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(raw) else {
        return raw.to_string();
    };

    let lowered_scheme = parsed.scheme().to_lowercase();
    let _ = parsed.set_scheme(&lowered_scheme);
    parsed.set_fragment(None);

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.to_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let mut qp = parsed.query_pairs_mut();
        qp.clear();
        for (k, v) in &kept {
            qp.append_pair(k, v);
        }
    }
    parsed.to_string()
}

/// The path component of an already-canonicalized URL, used for fingerprinting only
/// (spec.md §3: the fingerprint hashes `{title, company, url-path}`, not the query
/// string, so two canonical URLs differing only by a non-tracking query parameter
/// still identify the same listing for dedup purposes).
#[must_use]
pub fn url_path(canonical_url: &str) -> String {
    url::Url::parse(canonical_url).map(|u| u.path().to_string()).unwrap_or_else(|_| canonical_url.to_string())
}

/// Remote / OnSite / Hybrid classification, inferred primarily from the source
/// query URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Modality {
    Remote,
    OnSite,
    Hybrid,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Seniority {
    Intern,
    Junior,
    Mid,
    Senior,
    Specialist,
    #[default]
    Unknown,
}

/// A query the system may run, and the unit the Scheduler (C3) selects on and the
/// Recorder (C10) scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UrlCategory {
    Remote,
    OnSite,
    Hybrid,
    Geographic,
    Professional,
    Seniority,
    General,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HourBucket {
    pub runs: u32,
    pub new_jobs: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayBucket {
    pub runs: u32,
    pub new_jobs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogUrl {
    pub url: String,
    pub category: UrlCategory,
    pub enabled: bool,
    /// Maintained by the Recorder (C10); in `[0, 1]`.
    pub performance_score: f64,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Keyed by hour-of-day, `0..24`.
    pub hourly_stats: BTreeMap<u8, HourBucket>,
    /// Keyed by ISO weekday, `0..7` (Monday = 0).
    pub daily_stats: BTreeMap<u8, DayBucket>,
}

impl CatalogUrl {
    #[must_use]
    pub fn new(url: impl Into<String>, category: UrlCategory) -> Self {
        Self {
            url: url.into(),
            category,
            enabled: true,
            performance_score: 0.0,
            last_run_at: None,
            hourly_stats: BTreeMap::new(),
            daily_stats: BTreeMap::new(),
        }
    }
}

/// The atomic unit collected from a listing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub fingerprint: Fingerprint,
    pub url: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub modality: Modality,
    pub seniority: Seniority,
    /// Free-text category (tech, sales, ...) or "Unknown".
    pub area: String,
    pub technologies: BTreeSet<String>,
    pub salary_text: String,
    /// Minor-unit (cents) integer bounds; see DESIGN.md for why not a decimal type.
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub collected_at: DateTime<Utc>,
    /// The catalog entry that produced this record.
    pub source_query: String,
}

/// Material fields compared by the Deduplicator (C6) to distinguish `Updated` from
/// `Duplicate`. Salary/location-free-text deliberately excluded from the fingerprint
/// itself (spec.md §8 S3) but included here for the material-field diff.
impl JobRecord {
    #[must_use]
    pub fn material_fields(&self) -> (&str, &str, &str, &str, Modality) {
        (
            &self.title,
            &self.company,
            &self.salary_text,
            &self.location,
            self.modality,
        )
    }
}

/// What C8 stores, keyed by `Fingerprint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub latest: JobRecord,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub observation_count: u64,
}

/// Per-`SourceQuery` persistent state enabling incremental runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub url: String,
    pub fingerprints_seen: BTreeSet<Fingerprint>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: RunOutcome,
    pub performance_score_at_commit: f64,
}

impl Checkpoint {
    #[must_use]
    pub fn empty(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fingerprints_seen: BTreeSet::new(),
            last_run_at: None,
            last_outcome: RunOutcome::default(),
            performance_score_at_commit: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunOutcome {
    pub new: usize,
    pub updated: usize,
    pub duplicate: usize,
}

/// Per-URL metrics attached to a `SessionResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlMetrics {
    pub url: String,
    pub pages_fetched: u32,
    pub new_jobs: usize,
    pub updated_jobs: usize,
    pub duplicate_jobs: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

/// One per orchestrated run; persisted separately from the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records in extraction order, not dedup order; ties broken by (url, page_no, index).
    pub new_records: Vec<JobRecord>,
    pub updated_records: Vec<JobRecord>,
    pub url_metrics: Vec<UrlMetrics>,
    pub wall_clock_ms: u64,
    pub errors: Vec<crate::error::UrlError>,
    /// First fatal condition, if the run aborted early.
    pub fatal_error: Option<String>,
    /// RNG seed used by the scheduler's tie-breaking, recorded for reproducibility.
    pub scheduler_seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_lowercases_scheme_and_drops_fragment() {
        let out = canonicalize_url("HTTPS://example.com/jobs/123#apply");
        assert_eq!(out, "https://example.com/jobs/123");
    }

    #[test]
    fn canonicalize_strips_tracking_params_but_keeps_others() {
        let out = canonicalize_url("https://example.com/jobs/123?utm_source=x&role=rust&gclid=y");
        assert_eq!(out, "https://example.com/jobs/123?role=rust");
    }

    #[test]
    fn tracking_params_only_url_has_no_query() {
        let out = canonicalize_url("https://example.com/jobs/123?utm_source=x&fbclid=y");
        assert_eq!(out, "https://example.com/jobs/123");
    }

    #[test]
    fn url_path_ignores_query_string() {
        assert_eq!(url_path("https://example.com/jobs/123?role=rust"), "/jobs/123");
        assert_eq!(url_path("https://example.com/jobs/123?role=backend"), "/jobs/123");
    }

    proptest::proptest! {
        /// Canonicalization must be stable: running it twice is the same as once.
        #[test]
        fn canonicalize_is_idempotent(slug in "[a-z]{1,12}", value in "[a-zA-Z0-9]{0,10}") {
            let raw = format!("https://example.com/jobs/{slug}?role={value}");
            let once = canonicalize_url(&raw);
            let twice = canonicalize_url(&once);
            proptest::prop_assert_eq!(once, twice);
        }

        /// The fingerprint-relevant URL path is unaffected by which tracking
        /// parameter values are attached, only by the path itself (spec.md §3:
        /// the fingerprint hashes `{title, company, url-path}`, not the query).
        #[test]
        fn url_path_is_stable_under_tracking_params(slug in "[a-z]{1,12}", click_id in "[a-zA-Z0-9]{1,16}") {
            let tracked = format!("https://example.com/jobs/{slug}?utm_source=newsletter&gclid={click_id}");
            let bare = format!("https://example.com/jobs/{slug}");
            proptest::prop_assert_eq!(url_path(&canonicalize_url(&tracked)), url_path(&canonicalize_url(&bare)));
        }
    }
}
