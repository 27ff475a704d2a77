//! Extractor (C5): turns a fetched HTML snapshot into `JobRecord`s.
//!
//! The selector cascade and `scraper`-based DOM walk follow
//! `content_saver/markdown_converter/html_preprocessing/main_content_extraction.rs`'s
//! pattern of statically-parsed, `LazyLock`-cached `Selector`s tried in priority
//! order. The technology vocabulary is lifted from
//! `original_source/src/ml/models/salary_predictor.py::tech_values` (kept as a
//! lookup table without the market-value weights, which this crate has no use for).

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use crate::model::{JobRecord, Modality, Seniority};

/// Minimum number of elements a candidate listing selector must match to be accepted
/// (spec.md §4.5: "first selector yielding >= K elements wins").
pub const MIN_LISTING_ELEMENTS: usize = 2;

const MAX_FIELD_CHARS: usize = 200;

/// Candidate selectors for a single job-listing card, tried in order; the first to
/// match at least [`MIN_LISTING_ELEMENTS`] elements is used for the whole page.
static LISTING_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "[data-testid='job-card']",
        "article.job-listing",
        "li.job-result",
        ".job-card",
        ".vacancy-item",
        "article",
    ]
    .iter()
    .filter_map(|s| Selector::parse(s).ok())
    .collect()
});

static TITLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h2, h3, .job-title, [data-testid='job-title']").expect("valid selector"));
static COMPANY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".company, .employer, [data-testid='company-name']").expect("valid selector"));
static LOCATION_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".location, [data-testid='job-location']").expect("valid selector"));
static SALARY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".salary, [data-testid='salary']").expect("valid selector"));
static LINK_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

/// Relative market-weighting dropped; kept as a plain vocabulary for token matching.
static TECHNOLOGIES: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "python", "java", "javascript", "typescript", "go", "rust", "scala", "kotlin", "c++", "c#", "php", "ruby",
        "swift", "react", "angular", "vue", "node.js", "django", "flask", "spring", ".net", "rails", "tensorflow",
        "pytorch", "scikit-learn", "pandas", "spark", "hadoop", "aws", "azure", "gcp", "docker", "kubernetes",
        "terraform", "jenkins", "mysql", "postgresql", "mongodb", "redis", "elasticsearch", "cassandra", "oracle",
    ]
});

/// Parsed listing elements plus the source URL they came from, for modality/
/// seniority/area inference from the URL path (spec.md §4.5).
pub struct ExtractionContext<'a> {
    pub source_url: &'a str,
}

/// Extracts every job record found on a single rendered HTML page.
#[must_use]
pub fn extract_records(html: &str, ctx: &ExtractionContext<'_>) -> Vec<JobRecord> {
    let document = Html::parse_document(html);

    let Some(selector) = LISTING_SELECTORS
        .iter()
        .find(|s| document.select(s).count() >= MIN_LISTING_ELEMENTS)
    else {
        return Vec::new();
    };

    let (modality, seniority, area) = infer_from_url(ctx.source_url);

    document
        .select(selector)
        .filter_map(|el| record_from_element(el, ctx.source_url, modality, seniority, &area))
        .collect()
}

fn record_from_element(
    el: ElementRef<'_>,
    source_url: &str,
    modality: Modality,
    seniority: Seniority,
    area: &str,
) -> Option<JobRecord> {
    let title = truncated_text(el, &TITLE_SELECTOR)?;
    let company = truncated_text(el, &COMPANY_SELECTOR).unwrap_or_default();
    let location = truncated_text(el, &LOCATION_SELECTOR).unwrap_or_default();
    let salary_text = truncated_text(el, &SALARY_SELECTOR).unwrap_or_default();

    let url = el
        .select(&LINK_SELECTOR)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(|href| resolve_url(source_url, href))
        .unwrap_or_else(|| source_url.to_string());
    let url = crate::model::canonicalize_url(&url);

    let technologies = detect_technologies(&el.text().collect::<String>());
    let (salary_min, salary_max) = parse_salary_range(&salary_text);

    let url_path = crate::model::url_path(&url);
    let fingerprint = crate::model::Fingerprint::from_u128(xxhash_rust::xxh3::xxh3_128(
        format!("{title}|{company}|{url_path}").as_bytes(),
    ));

    Some(JobRecord {
        fingerprint,
        url,
        title,
        company,
        location,
        modality,
        seniority,
        area: area.to_string(),
        technologies,
        salary_text,
        salary_min,
        salary_max,
        collected_at: chrono::Utc::now(),
        source_query: source_url.to_string(),
    })
}

fn truncated_text(el: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let text: String = el.select(selector).next()?.text().collect::<Vec<_>>().join(" ");
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_FIELD_CHARS).collect())
}

fn resolve_url(base: &str, href: &str) -> String {
    url::Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

fn detect_technologies(text: &str) -> std::collections::BTreeSet<String> {
    let lowered = text.to_lowercase();
    TECHNOLOGIES
        .iter()
        .filter(|tech| word_boundary_contains(&lowered, tech))
        .map(|tech| (*tech).to_string())
        .collect()
}

fn word_boundary_contains(haystack: &str, needle: &str) -> bool {
    // Technology tokens may contain non-word characters (`c++`, `.net`, `node.js`);
    // a plain substring check with surrounding-boundary validation keeps this cheap
    // without building a regex per vocabulary entry.
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before_ok = haystack[..abs].chars().next_back().is_none_or(|c| !c.is_alphanumeric());
        let after_idx = abs + needle.len();
        let after_ok = haystack[after_idx..].chars().next().is_none_or(|c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

/// Parses a free-text salary range into minor units (cents), best-effort. Returns
/// `(None, None)` when no numeric range can be recovered.
fn parse_salary_range(text: &str) -> (Option<i64>, Option<i64>) {
    let digits_groups: Vec<i64> = text
        .split(|c: char| !c.is_ascii_digit() && c != '.' && c != ',')
        .filter_map(|chunk| {
            let cleaned: String = chunk.chars().filter(|c| c.is_ascii_digit()).collect();
            cleaned.parse::<i64>().ok()
        })
        .filter(|n| *n > 0)
        .collect();

    match digits_groups.as_slice() {
        [] => (None, None),
        [single] => (Some(single * 100), Some(single * 100)),
        [low, high, ..] => (Some(low.min(high) * 100), Some(low.max(high) * 100)),
    }
}

/// Infers modality/seniority/area from path segments of the catalog URL — the same
/// signal the scheduler's `UrlCategory` classification draws on.
fn infer_from_url(source_url: &str) -> (Modality, Seniority, String) {
    let lowered = source_url.to_lowercase();
    let modality = if lowered.contains("remote") || lowered.contains("remoto") {
        Modality::Remote
    } else if lowered.contains("hybrid") || lowered.contains("hibrido") {
        Modality::Hybrid
    } else if lowered.contains("on-site") || lowered.contains("presencial") {
        Modality::OnSite
    } else {
        Modality::Unknown
    };

    let seniority = if lowered.contains("senior") || lowered.contains("senior") {
        Seniority::Senior
    } else if lowered.contains("junior") {
        Seniority::Junior
    } else if lowered.contains("intern") || lowered.contains("estagio") {
        Seniority::Intern
    } else if lowered.contains("specialist") || lowered.contains("especialista") {
        Seniority::Specialist
    } else {
        Seniority::Unknown
    };

    let area = url::Url::parse(source_url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(String::from)))
        .unwrap_or_default();

    (modality, seniority, area)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_HTML: &str = r#"
        <html><body>
            <article class="job-listing">
                <h2 class="job-title">Senior Rust Engineer</h2>
                <span class="company">Acme Corp</span>
                <span class="location">Remote</span>
                <span class="salary">R$ 12.000 - R$ 16.000</span>
                <a href="/jobs/123">View</a>
                <p>Looking for someone strong in rust and docker and kubernetes.</p>
            </article>
            <article class="job-listing">
                <h2 class="job-title">Backend Developer</h2>
                <span class="company">Beta LLC</span>
                <span class="location">Sao Paulo</span>
                <a href="/jobs/124">View</a>
                <p>Python and postgresql experience required.</p>
            </article>
        </body></html>
    "#;

    #[test]
    fn extracts_two_records_from_sample_page() {
        let ctx = ExtractionContext { source_url: "https://example.com/jobs/remote" };
        let records = extract_records(SAMPLE_HTML, &ctx);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title, "Senior Rust Engineer");
        assert!(records[0].technologies.contains("rust"));
        assert!(records[0].technologies.contains("docker"));
        assert_eq!(records[0].modality, Modality::Remote);
    }

    #[test]
    fn parses_salary_range_in_minor_units() {
        let (min, max) = parse_salary_range("R$ 12.000 - R$ 16.000");
        assert_eq!(min, Some(12_000_00));
        assert_eq!(max, Some(16_000_00));
    }

    #[test]
    fn word_boundary_avoids_partial_matches() {
        assert!(!word_boundary_contains("javascriptsomething", "java"));
        assert!(word_boundary_contains("experience with java backend", "java"));
    }

    #[test]
    fn below_threshold_listing_yields_nothing() {
        let ctx = ExtractionContext { source_url: "https://example.com/jobs" };
        let html = "<html><body><article class=\"job-listing\"><h2>Only one</h2></article></body></html>";
        assert!(extract_records(html, &ctx).is_empty());
    }
}
