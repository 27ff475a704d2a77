//! URL Scheduler (C3): picks `N` catalog URLs per session.
//!
//! The `ml` policy's scoring formula is lifted near-verbatim from
//! `original_source/src/ml/url_optimizer.py::_calculate_url_score` /
//! `get_optimized_urls`, re-expressed in the teacher's idiom (explicit `Result`-free
//! pure function over owned structs, no JSON file IO inside the scorer itself — that
//! lives in `crate::recorder`).

use std::collections::HashSet;

use chrono::{Timelike, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::model::{CatalogUrl, UrlCategory};

/// Closed set of selection policies (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Policy {
    Balanced,
    Geographic,
    RemoteOnly,
    Professional,
    SeniorityOnly,
    Complete,
    Custom,
    Ml,
}

/// Minimum historical sessions a URL needs before `ml` will rank it by score rather
/// than fall back to round-robin. See DESIGN.md Open Question 2 for why this diverges
/// from the Python original.
pub const ML_MIN_SAMPLES: u32 = 5;

/// Selects `n` URLs from `catalog` according to `policy`. `custom_urls` is only
/// consulted when `policy == Custom`. `rng_seed` makes tie-breaks reproducible and is
/// echoed back on `SessionResult::scheduler_seed`.
#[must_use]
pub fn select_urls(
    catalog: &[CatalogUrl],
    n: usize,
    policy: Policy,
    custom_urls: &[String],
    rng_seed: u64,
) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(rng_seed);
    let enabled: Vec<&CatalogUrl> = catalog.iter().filter(|c| c.enabled).collect();

    match policy {
        Policy::Custom => custom_urls.to_vec(),
        Policy::Geographic => take_category(&enabled, UrlCategory::Geographic, n, &mut rng),
        Policy::RemoteOnly => take_category(&enabled, UrlCategory::Remote, n, &mut rng),
        Policy::Professional => take_category(&enabled, UrlCategory::Professional, n, &mut rng),
        Policy::SeniorityOnly => take_category(&enabled, UrlCategory::Seniority, n, &mut rng),
        Policy::Complete => proportional_sample(&enabled, n, &mut rng),
        Policy::Balanced => balanced_sample(&enabled, n, &mut rng),
        Policy::Ml => ml_sample(&enabled, n, &mut rng),
    }
}

fn take_category(
    enabled: &[&CatalogUrl],
    category: UrlCategory,
    n: usize,
    rng: &mut StdRng,
) -> Vec<String> {
    let mut matching: Vec<&str> = enabled
        .iter()
        .filter(|c| c.category == category)
        .map(|c| c.url.as_str())
        .collect();
    matching.shuffle(rng);
    matching.into_iter().take(n).map(String::from).collect()
}

fn proportional_sample(enabled: &[&CatalogUrl], n: usize, rng: &mut StdRng) -> Vec<String> {
    let categories = [
        UrlCategory::Remote,
        UrlCategory::OnSite,
        UrlCategory::Hybrid,
        UrlCategory::Geographic,
        UrlCategory::Professional,
        UrlCategory::Seniority,
        UrlCategory::General,
    ];
    let mut out = Vec::with_capacity(n);
    let mut remaining = n;
    for (i, cat) in categories.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let share = (remaining / (categories.len() - i)).max(1);
        let mut picks = take_category(enabled, *cat, share, rng);
        remaining -= picks.len().min(remaining);
        out.append(&mut picks);
    }
    fill_random(enabled, &mut out, n, rng);
    out
}

fn balanced_sample(enabled: &[&CatalogUrl], n: usize, rng: &mut StdRng) -> Vec<String> {
    let rotation = [
        UrlCategory::Remote,
        UrlCategory::OnSite,
        UrlCategory::Hybrid,
        UrlCategory::Geographic,
        UrlCategory::General,
    ];
    let mut out = Vec::with_capacity(n);
    let mut seen: HashSet<String> = HashSet::new();
    'outer: loop {
        let before = out.len();
        for cat in rotation {
            if out.len() >= n {
                break 'outer;
            }
            if let Some(pick) = enabled
                .iter()
                .filter(|c| c.category == cat && !seen.contains(&c.url))
                .collect::<Vec<_>>()
                .choose(rng)
            {
                seen.insert(pick.url.clone());
                out.push(pick.url.clone());
            }
        }
        if out.len() == before {
            break;
        }
    }
    fill_random(enabled, &mut out, n, rng);
    out
}

fn fill_random(enabled: &[&CatalogUrl], out: &mut Vec<String>, n: usize, rng: &mut StdRng) {
    if out.len() >= n {
        return;
    }
    let seen: HashSet<&str> = out.iter().map(String::as_str).collect();
    let mut rest: Vec<&str> = enabled
        .iter()
        .map(|c| c.url.as_str())
        .filter(|u| !seen.contains(u))
        .collect();
    rest.shuffle(rng);
    for u in rest {
        if out.len() >= n {
            break;
        }
        out.push(u.to_string());
    }
}

/// Score a catalog URL per the formula in spec.md §4.3 / §4.10:
/// `0.4·normNewJobs + 0.3·uniquenessRatio + 0.2·normSpeed + 0.1·(1-errorRate)`,
/// a hourly bonus, and a recency penalty — grounded on
/// `url_optimizer.py::_calculate_url_score` and `get_optimized_urls`.
#[must_use]
pub fn score_url(url: &CatalogUrl, current_hour: u8, total_runs_for_gate: u32) -> f64 {
    if total_runs_for_gate < ML_MIN_SAMPLES {
        return 0.5;
    }
    let base = url.performance_score;

    let mut hourly_bonus = 0.0;
    if let Some(bucket) = url.hourly_stats.get(&current_hour) {
        if bucket.runs > 0 {
            let hourly_avg = f64::from(bucket.new_jobs) / f64::from(bucket.runs);
            let overall_runs: u32 = url.hourly_stats.values().map(|b| b.runs).sum();
            let overall_new: u32 = url.hourly_stats.values().map(|b| b.new_jobs).sum();
            let overall_avg = f64::from(overall_new) / f64::from(overall_runs.max(1));
            if hourly_avg > overall_avg && overall_avg > 0.0 {
                hourly_bonus = 0.2 * (hourly_avg / overall_avg - 1.0);
            }
        }
    }

    let mut recency_penalty = 0.0;
    if let Some(last_run) = url.last_run_at {
        let days_since = (Utc::now() - last_run).num_days().max(0);
        if days_since > 7 {
            recency_penalty = 0.1 * (f64::from(days_since as u32) / 30.0).min(1.0);
        }
    }

    (base + hourly_bonus - recency_penalty).clamp(0.0, 1.0)
}

fn ml_sample(enabled: &[&CatalogUrl], n: usize, rng: &mut StdRng) -> Vec<String> {
    let hour = Utc::now().hour() as u8;
    let mut scored: Vec<(String, f64)> = enabled
        .iter()
        .map(|c| {
            let total_runs: u32 = c.hourly_stats.values().map(|b| b.runs).sum();
            (c.url.clone(), score_url(c, hour, total_runs))
        })
        .collect();
    scored.shuffle(rng);
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(n).map(|(u, _)| u).collect()
}

/// `0.4·normNewJobs + 0.3·uniquenessRatio + 0.2·normSpeed + 0.1·errorFreedom`,
/// the raw performance-score update fed by the Recorder (C10) after each run.
#[must_use]
pub fn recompute_performance_score(
    total_runs: u32,
    total_new_jobs: u32,
    total_jobs_seen: u32,
    total_time_secs: f64,
    total_errors: u32,
) -> f64 {
    if total_runs == 0 {
        return 0.5;
    }
    let avg_new_jobs = f64::from(total_new_jobs) / f64::from(total_runs);
    let unique_ratio = f64::from(total_new_jobs) / f64::from(total_jobs_seen.max(1));
    let avg_time = total_time_secs / f64::from(total_runs);
    let error_rate = f64::from(total_errors) / f64::from(total_runs);

    let normalized_new_jobs = (avg_new_jobs / 50.0).min(1.0);
    let normalized_unique = unique_ratio;
    let normalized_time = 1.0 - (avg_time / 60.0).min(1.0);
    let normalized_errors = 1.0 - error_rate.min(1.0);

    let score =
        normalized_new_jobs * 0.4 + normalized_unique * 0.3 + normalized_time * 0.2 + normalized_errors * 0.1;
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(cat: UrlCategory) -> CatalogUrl {
        CatalogUrl::new("https://example.com/x", cat)
    }

    #[test]
    fn custom_policy_returns_pinned_list() {
        let catalog = vec![url(UrlCategory::Remote)];
        let custom = vec!["https://pinned.example/a".to_string()];
        let result = select_urls(&catalog, 5, Policy::Custom, &custom, 1);
        assert_eq!(result, custom);
    }

    #[test]
    fn score_below_min_samples_is_neutral() {
        let u = url(UrlCategory::Remote);
        assert_eq!(score_url(&u, 12, 2), 0.5);
    }

    #[test]
    fn recompute_score_matches_zero_run_default() {
        assert_eq!(recompute_performance_score(0, 0, 0, 0.0, 0), 0.5);
    }

    #[test]
    fn recompute_score_rewards_new_jobs_and_speed() {
        let fast = recompute_performance_score(10, 400, 400, 50.0, 0);
        let slow = recompute_performance_score(10, 400, 400, 590.0, 0);
        assert!(fast > slow);
    }
}
