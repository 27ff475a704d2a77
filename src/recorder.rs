//! Performance/Temporal Recorder (C10): folds a URL's per-run outcome into its
//! `CatalogUrl` hourly/daily buckets and recomputed `performance_score`, per
//! spec.md §4.10.
//!
//! Grounded on `original_source/src/ml/temporal_analyzer.py::record_scraping_session`
//! (hour-of-day / day-of-week bucketed history) and `url_optimizer.py`'s score
//! recompute, re-expressed over the `CatalogUrl::hourly_stats`/`daily_stats`
//! `BTreeMap`s already in `model.rs` rather than the Python original's separate
//! `temporal_patterns.json` file — this crate keeps per-URL history alongside the
//! URL itself in the catalog, not in a second store.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::model::{CatalogUrl, UrlMetrics};
use crate::scheduler::recompute_performance_score;

/// Folds one URL's run outcome (already reflected in `metrics`) into `catalog_url`'s
/// history and recomputes its `performance_score`. Call once per URL per session,
/// after the orchestrator finishes paginating it.
pub fn record_run(catalog_url: &mut CatalogUrl, metrics: &UrlMetrics, finished_at: DateTime<Utc>) {
    let hour = finished_at.hour() as u8;
    let weekday = finished_at.weekday().num_days_from_monday() as u8;

    let hour_bucket = catalog_url.hourly_stats.entry(hour).or_default();
    hour_bucket.runs += 1;
    hour_bucket.new_jobs += metrics.new_jobs as u32;

    let day_bucket = catalog_url.daily_stats.entry(weekday).or_default();
    day_bucket.runs += 1;
    day_bucket.new_jobs += metrics.new_jobs as u32;

    let total_runs: u32 = catalog_url.hourly_stats.values().map(|b| b.runs).sum();
    let total_new_jobs: u32 = catalog_url.hourly_stats.values().map(|b| b.new_jobs).sum();
    let total_jobs_seen = total_new_jobs + (metrics.updated_jobs + metrics.duplicate_jobs) as u32;

    catalog_url.performance_score = recompute_performance_score(
        total_runs,
        total_new_jobs,
        total_jobs_seen,
        metrics.duration_ms as f64 / 1000.0,
        metrics.errors as u32,
    );
    catalog_url.last_run_at = Some(finished_at);
}

/// Folds every `UrlMetrics` in a `SessionResult` into the matching `CatalogUrl` in
/// `catalog`, skipping entries whose URL isn't found (e.g. the catalog changed
/// between selection and recording).
pub fn record_session(catalog: &mut [CatalogUrl], url_metrics: &[UrlMetrics], finished_at: DateTime<Utc>) {
    for metrics in url_metrics {
        if let Some(catalog_url) = catalog.iter_mut().find(|c| c.url == metrics.url) {
            record_run(catalog_url, metrics, finished_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UrlCategory;

    fn metrics(url: &str, new_jobs: usize) -> UrlMetrics {
        UrlMetrics {
            url: url.to_string(),
            pages_fetched: 2,
            new_jobs,
            updated_jobs: 0,
            duplicate_jobs: 0,
            errors: 0,
            duration_ms: 500,
        }
    }

    #[test]
    fn records_bump_hourly_and_daily_buckets() {
        let mut url = CatalogUrl::new("https://example.com/jobs", UrlCategory::Remote);
        let m = metrics("https://example.com/jobs", 10);
        let now = Utc::now();
        record_run(&mut url, &m, now);

        let hour = now.hour() as u8;
        assert_eq!(url.hourly_stats.get(&hour).unwrap().runs, 1);
        assert_eq!(url.hourly_stats.get(&hour).unwrap().new_jobs, 10);
        assert!(url.last_run_at.is_some());
    }

    #[test]
    fn record_session_skips_unknown_urls() {
        let mut catalog = vec![CatalogUrl::new("https://example.com/a", UrlCategory::Remote)];
        let metrics = vec![metrics("https://example.com/unknown", 5)];
        record_session(&mut catalog, &metrics, Utc::now());
        assert_eq!(catalog[0].hourly_stats.len(), 0);
    }

    #[test]
    fn repeated_runs_accumulate() {
        let mut url = CatalogUrl::new("https://example.com/jobs", UrlCategory::Remote);
        let now = Utc::now();
        record_run(&mut url, &metrics("https://example.com/jobs", 5), now);
        record_run(&mut url, &metrics("https://example.com/jobs", 5), now);
        let hour = now.hour() as u8;
        assert_eq!(url.hourly_stats.get(&hour).unwrap().runs, 2);
        assert_eq!(url.hourly_stats.get(&hour).unwrap().new_jobs, 10);
    }
}
