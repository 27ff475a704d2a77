//! Compressed Cache (C8): the durable store of `CacheEntry`s keyed by `Fingerprint`,
//! plus inverted indexes for `Search`/`TopCompanies`/`TopTechnologies` (spec.md §4.8).
//!
//! Primary store is an append-only log at `cacheDir/primary.blob`: a sequence of
//! `[u8 kind][u32 len][u64 xxh3 checksum][gzip bytes]` records, one per write,
//! grounded on `content_saver/compression.rs`'s gzip-the-payload pattern
//! (simplified: one file, not per-URL files, since records are small and
//! numerous). Checksums use `xxhash_rust::xxh3` rather than CRC32 — already a
//! teacher dependency used elsewhere in this crate for fingerprints and
//! checkpoint filenames, so no new dependency is introduced for this (see
//! DESIGN.md). A bounded `lru::LruCache` holds decompressed entries; fingerprints
//! dropped from it by normal LRU pressure are still found via `offsets` and
//! rehydrated from the primary log on the next `get` — but an explicit
//! [`Cache::evict`] call additionally removes the fingerprint from `offsets` and
//! every inverted index and appends a tombstone record, so it does not come back.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::HarvestError;
use crate::model::{CacheEntry, Fingerprint, JobRecord};

/// A compressed job-entry record.
const RECORD_ENTRY: u8 = 0;
/// Marks a fingerprint as removed; written by [`Cache::evict`] so the removal
/// survives a reopen instead of being resurrected by log replay.
const RECORD_TOMBSTONE: u8 = 1;

pub struct Cache {
    primary_path: PathBuf,
    write_lock: AsyncMutex<()>,
    offsets: DashMap<Fingerprint, u64>,
    hot: Mutex<LruCache<Fingerprint, CacheEntry>>,
    company_index: DashMap<String, DashSet<Fingerprint>>,
    tech_index: DashMap<String, DashSet<Fingerprint>>,
    location_index: DashMap<String, DashSet<Fingerprint>>,
}

impl Cache {
    /// Opens (creating if absent) the cache at `cache_dir`, replaying `primary.blob`
    /// to rebuild `offsets` and the inverted indexes. `hot_capacity` bounds the
    /// decompressed-entry LRU.
    pub async fn open(cache_dir: &Path, hot_capacity: usize) -> Result<Self> {
        tokio::fs::create_dir_all(cache_dir).await.context("failed to create cache dir")?;
        let primary_path = cache_dir.join("primary.blob");

        let cache = Self {
            primary_path,
            write_lock: AsyncMutex::new(()),
            offsets: DashMap::new(),
            hot: Mutex::new(LruCache::new(NonZeroUsize::new(hot_capacity.max(1)).unwrap())),
            company_index: DashMap::new(),
            tech_index: DashMap::new(),
            location_index: DashMap::new(),
        };
        cache.rebuild_from_primary().await?;
        Ok(cache)
    }

    async fn rebuild_from_primary(&self) -> Result<()> {
        let path = self.primary_path.clone();
        let raw = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("failed to read primary cache blob"),
        };

        let mut cursor = 0usize;
        while cursor + 13 <= raw.len() {
            let offset = cursor as u64;
            let kind = raw[cursor];
            let len = u32::from_be_bytes(raw[cursor + 1..cursor + 5].try_into().unwrap()) as usize;
            let checksum = u64::from_be_bytes(raw[cursor + 5..cursor + 13].try_into().unwrap());
            let body_start = cursor + 13;
            let body_end = body_start + len;
            if body_end > raw.len() {
                warn!("primary cache blob truncated at offset {offset}; stopping replay");
                break;
            }
            let body = &raw[body_start..body_end];
            if xxhash_rust::xxh3::xxh3_64(body) != checksum {
                warn!("checksum mismatch in primary cache blob at offset {offset}; skipping record");
                cursor = body_end;
                continue;
            }

            match kind {
                RECORD_ENTRY => match decompress_entry(body) {
                    Ok(entry) => {
                        self.offsets.insert(entry.fingerprint, offset);
                        self.index_entry(&entry);
                        self.hot.lock().put(entry.fingerprint, entry);
                    }
                    Err(e) => warn!("failed to decompress cache record at offset {offset}: {e}"),
                },
                RECORD_TOMBSTONE => match decompress_tombstone(body) {
                    Ok(fp) => {
                        self.offsets.remove(&fp);
                        if let Some(entry) = self.hot.lock().pop(&fp) {
                            unindex_entry(&self.company_index, &self.tech_index, &self.location_index, &entry);
                        }
                    }
                    Err(e) => warn!("failed to decompress tombstone at offset {offset}: {e}"),
                },
                other => warn!("unknown cache record kind {other} at offset {offset}; skipping"),
            }
            cursor = body_end;
        }
        Ok(())
    }

    fn index_entry(&self, entry: &CacheEntry) {
        let company_key = entry.latest.company.to_lowercase();
        if !company_key.is_empty() {
            self.company_index.entry(company_key).or_default().insert(entry.fingerprint);
        }
        for tech in &entry.latest.technologies {
            self.tech_index.entry(tech.to_lowercase()).or_default().insert(entry.fingerprint);
        }
        let location_key = entry.latest.location.to_lowercase();
        if !location_key.is_empty() {
            self.location_index.entry(location_key).or_default().insert(entry.fingerprint);
        }
    }

    /// Inserts or refreshes the entry for `record.fingerprint`, appending a new
    /// record to the primary log (the log is a history; `offsets` always points at
    /// the latest).
    pub async fn put(&self, record: JobRecord) -> Result<(), HarvestError> {
        let now = chrono::Utc::now();
        let previous = self.get(&record.fingerprint).await;

        let entry = CacheEntry {
            fingerprint: record.fingerprint,
            first_seen_at: previous.as_ref().map_or(now, |p| p.first_seen_at),
            last_seen_at: now,
            observation_count: previous.as_ref().map_or(1, |p| p.observation_count + 1),
            latest: record,
        };

        let body = compress_entry(&entry).map_err(|e| HarvestError::CacheCorruption(e.to_string()))?;
        let offset = self.append_record(RECORD_ENTRY, &body).await?;

        self.offsets.insert(entry.fingerprint, offset);
        self.index_entry(&entry);
        self.hot.lock().put(entry.fingerprint, entry);
        Ok(())
    }

    /// Appends one `[kind][len][checksum][body]` record and returns its offset.
    async fn append_record(&self, kind: u8, body: &[u8]) -> Result<u64, HarvestError> {
        let checksum = xxhash_rust::xxh3::xxh3_64(body);

        let _guard = self.write_lock.lock().await;
        let offset = tokio::fs::metadata(&self.primary_path).await.map(|m| m.len()).unwrap_or(0);

        let mut record_bytes = Vec::with_capacity(13 + body.len());
        record_bytes.push(kind);
        record_bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        record_bytes.extend_from_slice(&checksum.to_be_bytes());
        record_bytes.extend_from_slice(body);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.primary_path)
            .await
            .map_err(|e| HarvestError::CacheCorruption(e.to_string()))?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&record_bytes).await.map_err(|e| HarvestError::CacheCorruption(e.to_string()))?;
        Ok(offset)
    }

    /// Returns the latest entry for `fingerprint`, rehydrating from the primary log
    /// if it's been evicted from the hot LRU.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        if let Some(entry) = self.hot.lock().get(fingerprint).cloned() {
            return Some(entry);
        }
        let offset = *self.offsets.get(fingerprint)?;
        let entry = self.read_at(offset).await.ok()?;
        self.hot.lock().put(*fingerprint, entry.clone());
        Some(entry)
    }

    async fn read_at(&self, offset: u64) -> Result<CacheEntry> {
        let mut file = tokio::fs::File::open(&self.primary_path).await?;
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut header = [0u8; 13];
        file.read_exact(&mut header).await?;
        let len = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
        let checksum = u64::from_be_bytes(header[5..13].try_into().unwrap());
        let mut body = vec![0u8; len];
        file.read_exact(&mut body).await?;
        if xxhash_rust::xxh3::xxh3_64(&body) != checksum {
            anyhow::bail!("checksum mismatch reading cache record at offset {offset}");
        }
        decompress_entry(&body)
    }

    /// Case-insensitive lookup by company, technology, and/or location. Values
    /// within a field are OR-combined (any of the given companies matches); fields
    /// are ANDed together. An optional `time_window` (inclusive) further narrows
    /// the result by `CacheEntry.last_seen_at` (spec.md §4.8: `Search({companies?,
    /// technologies?, locations?, timeWindow?})`).
    pub async fn search(
        &self,
        companies: &[String],
        technologies: &[String],
        locations: &[String],
        time_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> BTreeSet<Fingerprint> {
        let sets: Vec<BTreeSet<Fingerprint>> = [
            (!companies.is_empty()).then(|| or_lookup(&self.company_index, companies)),
            (!technologies.is_empty()).then(|| or_lookup(&self.tech_index, technologies)),
            (!locations.is_empty()).then(|| or_lookup(&self.location_index, locations)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let combined = match sets.split_first() {
            Some((first, rest)) => rest.iter().fold(first.clone(), |acc, s| acc.intersection(s).copied().collect()),
            None if time_window.is_some() => self.offsets.iter().map(|e| *e.key()).collect(),
            None => BTreeSet::new(),
        };

        let Some((start, end)) = time_window else {
            return combined;
        };

        let mut filtered = BTreeSet::new();
        for fp in combined {
            if let Some(entry) = self.get(&fp).await {
                if entry.last_seen_at >= start && entry.last_seen_at <= end {
                    filtered.insert(fp);
                }
            }
        }
        filtered
    }

    #[must_use]
    pub fn top_companies(&self, n: usize) -> Vec<(String, usize)> {
        top_n(&self.company_index, n)
    }

    #[must_use]
    pub fn top_technologies(&self, n: usize) -> Vec<(String, usize)> {
        top_n(&self.tech_index, n)
    }

    /// Drops the least-recently-used entries until at most `target_len` remain,
    /// removing each from `offsets` and all three inverted indexes and appending a
    /// tombstone record to the primary log so the removal survives a reopen
    /// (spec.md §4.8 Evict: remove "from primary and all indexes atomically").
    pub async fn evict(&self, target_len: usize) -> Result<(), HarvestError> {
        let popped: Vec<(Fingerprint, CacheEntry)> = {
            let mut hot = self.hot.lock();
            let mut popped = Vec::new();
            while hot.len() > target_len {
                match hot.pop_lru() {
                    Some(pair) => popped.push(pair),
                    None => break,
                }
            }
            popped
        };

        for (fp, entry) in popped {
            self.offsets.remove(&fp);
            unindex_entry(&self.company_index, &self.tech_index, &self.location_index, &entry);
            let body = compress_tombstone(&fp).map_err(|e| HarvestError::CacheCorruption(e.to_string()))?;
            self.append_record(RECORD_TOMBSTONE, &body).await?;
        }
        Ok(())
    }
}

fn lookup(index: &DashMap<String, DashSet<Fingerprint>>, key: &str) -> BTreeSet<Fingerprint> {
    index.get(&key.to_lowercase()).map(|s| s.iter().map(|f| *f).collect()).unwrap_or_default()
}

fn or_lookup(index: &DashMap<String, DashSet<Fingerprint>>, keys: &[String]) -> BTreeSet<Fingerprint> {
    let mut out = BTreeSet::new();
    for key in keys {
        out.extend(lookup(index, key));
    }
    out
}

fn unindex_entry(
    company_index: &DashMap<String, DashSet<Fingerprint>>,
    tech_index: &DashMap<String, DashSet<Fingerprint>>,
    location_index: &DashMap<String, DashSet<Fingerprint>>,
    entry: &CacheEntry,
) {
    let company_key = entry.latest.company.to_lowercase();
    if let Some(set) = company_index.get(&company_key) {
        set.remove(&entry.fingerprint);
    }
    for tech in &entry.latest.technologies {
        if let Some(set) = tech_index.get(&tech.to_lowercase()) {
            set.remove(&entry.fingerprint);
        }
    }
    let location_key = entry.latest.location.to_lowercase();
    if let Some(set) = location_index.get(&location_key) {
        set.remove(&entry.fingerprint);
    }
}

fn top_n(index: &DashMap<String, DashSet<Fingerprint>>, n: usize) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = index.iter().map(|e| (e.key().clone(), e.value().len())).collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.truncate(n);
    counts
}

fn compress_entry(entry: &CacheEntry) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(entry)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

fn decompress_entry(body: &[u8]) -> Result<CacheEntry> {
    let mut decoder = GzDecoder::new(body);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

fn compress_tombstone(fingerprint: &Fingerprint) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(fingerprint)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

fn decompress_tombstone(body: &[u8]) -> Result<Fingerprint> {
    let mut decoder = GzDecoder::new(body);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Modality, Seniority};

    fn sample(title: &str) -> JobRecord {
        JobRecord {
            fingerprint: Fingerprint::from_u128(xxhash_rust::xxh3::xxh3_128(title.as_bytes())),
            url: "https://example.com/jobs/1".to_string(),
            title: title.to_string(),
            company: "Acme".to_string(),
            location: "Remote".to_string(),
            modality: Modality::Remote,
            seniority: Seniority::Mid,
            area: "engineering".to_string(),
            technologies: ["rust".to_string()].into_iter().collect(),
            salary_text: String::new(),
            salary_min: None,
            salary_max: None,
            collected_at: chrono::Utc::now(),
            source_query: "https://example.com/jobs".to_string(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 16).await.unwrap();
        let record = sample("Rust Engineer");
        let fp = record.fingerprint;
        cache.put(record).await.unwrap();

        let entry = cache.get(&fp).await.unwrap();
        assert_eq!(entry.latest.title, "Rust Engineer");
        assert_eq!(entry.observation_count, 1);
    }

    #[tokio::test]
    async fn repeated_put_increments_observation_count() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 16).await.unwrap();
        let record = sample("Rust Engineer");
        let fp = record.fingerprint;
        cache.put(record.clone()).await.unwrap();
        cache.put(record).await.unwrap();

        let entry = cache.get(&fp).await.unwrap();
        assert_eq!(entry.observation_count, 2);
    }

    #[tokio::test]
    async fn search_finds_by_technology() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 16).await.unwrap();
        cache.put(sample("Rust Engineer")).await.unwrap();

        let found = cache.search(&[], &["rust".to_string()], &[], None).await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn search_or_combines_within_a_field() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 16).await.unwrap();
        let mut a = sample("Rust Engineer");
        a.company = "Acme".to_string();
        let mut b = sample("Python Engineer");
        b.company = "Globex".to_string();
        cache.put(a).await.unwrap();
        cache.put(b).await.unwrap();

        let found = cache.search(&["acme".to_string(), "globex".to_string()], &[], &[], None).await;
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn search_time_window_excludes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 16).await.unwrap();
        cache.put(sample("Rust Engineer")).await.unwrap();

        let future_window = (chrono::Utc::now() + chrono::Duration::days(1), chrono::Utc::now() + chrono::Duration::days(2));
        let found = cache.search(&[], &["rust".to_string()], &[], Some(future_window)).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn reopen_rebuilds_indexes_from_primary_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = Cache::open(dir.path(), 16).await.unwrap();
            cache.put(sample("Rust Engineer")).await.unwrap();
        }
        let reopened = Cache::open(dir.path(), 16).await.unwrap();
        assert_eq!(reopened.top_technologies(5), vec![("rust".to_string(), 1)]);
    }

    #[tokio::test]
    async fn evict_removes_entry_from_cache_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 16).await.unwrap();
        let record = sample("Rust Engineer");
        let fp = record.fingerprint;
        cache.put(record).await.unwrap();

        cache.evict(0).await.unwrap();

        assert!(cache.get(&fp).await.is_none());
        assert!(cache.search(&[], &["rust".to_string()], &[], None).await.is_empty());
    }

    #[tokio::test]
    async fn evicted_entry_stays_gone_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let fp = {
            let cache = Cache::open(dir.path(), 16).await.unwrap();
            let record = sample("Rust Engineer");
            let fp = record.fingerprint;
            cache.put(record).await.unwrap();
            cache.evict(0).await.unwrap();
            fp
        };

        let reopened = Cache::open(dir.path(), 16).await.unwrap();
        assert!(reopened.get(&fp).await.is_none());
    }
}
