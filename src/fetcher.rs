//! Fetcher (C4): `FetchPage(url, pageNo)` — navigates a pooled browser page to the
//! requested paginated URL and returns its rendered HTML, or an end-of-pagination
//! signal.
//!
//! Grounded on `crawl_engine/page_processor.rs` (navigate → wait → extract shape)
//! and `crawl_engine/orchestrator.rs::calculate_retry_backoff` (exponential base,
//! per-`FailureKind` multiplier, ±20% jitter, 30s cap) — reused here verbatim for the
//! per-page retry loop, layered on top of (not replacing) the session-wide
//! `RateLimiter`'s adaptive backoff.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::browser_pool::BrowserPool;
use crate::error::{FailureKind, HarvestError, HarvestResult};
use crate::rate_limiter::RateLimiter;

const BASE_DELAY_MS: u64 = 1000;
const MAX_DELAY_MS: u64 = 30_000;
const JITTER_PERCENT: f64 = 0.2;

/// Phrases that mark the end of a URL's pagination (case-insensitive substring match
/// against the rendered page text), configurable per spec.md §4.4.
const NOT_FOUND_MARKERS: &[&str] = &["page not found", "404", "no results found", "no jobs found"];

/// Phrases that mark a challenge/anti-bot wall (case-insensitive substring match
/// against the rendered page text). A challenge page typically renders as a
/// *successful* navigation, not a fetch error, so this has to be checked against
/// content rather than inferred from `FailureKind::classify`'s message matching.
const ANTI_BOT_MARKERS: &[&str] = &[
    "checking your browser",
    "verify you are human",
    "verify you are a human",
    "are you a robot",
    "unusual traffic",
    "access denied",
    "request blocked",
    "ddos-guard",
    "captcha",
    "recaptcha",
    "hcaptcha",
];

pub struct FetcherContext {
    pub pool: Arc<BrowserPool>,
    pub rate_limiter: Arc<RateLimiter>,
    pub page_load_timeout: Duration,
    pub element_wait_timeout: Duration,
    pub retry_attempts: u8,
    pub steady_state_floor: Duration,
}

#[derive(Debug, Clone)]
pub enum PageOutcome {
    /// Rendered HTML for a page that looks like it has content.
    Content(String),
    /// Pagination ended; `reason` is a short machine-readable tag for events/logs.
    EndOfPagination(&'static str),
    /// Navigation succeeded but the rendered page is a challenge/anti-bot wall.
    AntiBot,
}

/// Builds the URL for page `page_no` of a catalog entry. Page 1 is the URL as-is;
/// subsequent pages append (or replace) a `page` query parameter.
#[must_use]
pub fn paged_url(base: &str, page_no: u32) -> String {
    if page_no <= 1 {
        return base.to_string();
    }
    match url::Url::parse(base) {
        Ok(mut parsed) => {
            let existing: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(k, _)| k != "page")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            {
                let mut qp = parsed.query_pairs_mut();
                qp.clear();
                for (k, v) in &existing {
                    qp.append_pair(k, v);
                }
                qp.append_pair("page", &page_no.to_string());
            }
            parsed.into()
        }
        Err(_) => format!("{base}{sep}page={page_no}", sep = if base.contains('?') { '&' } else { '?' }),
    }
}

/// Fetch one page, retrying transient failures with exponential backoff
/// (`calculate_retry_backoff`-equivalent) up to `ctx.retry_attempts` times.
pub async fn fetch_page(ctx: &FetcherContext, url: &str, page_no: u32) -> HarvestResult<PageOutcome> {
    let target = paged_url(url, page_no);
    let mut attempt: u8 = 0;

    loop {
        ctx.rate_limiter.acquire().await;

        match fetch_once(ctx, &target).await {
            Ok(PageOutcome::AntiBot) => {
                ctx.rate_limiter.report_error(FailureKind::AntiBot);
                warn!("anti-bot challenge detected at {target}");
                return Err(HarvestError::AntiBot { url: target });
            }
            Ok(outcome) => {
                ctx.rate_limiter.report_success(ctx.steady_state_floor);
                return Ok(outcome);
            }
            Err(err) => {
                let kind = FailureKind::classify(&err);
                ctx.rate_limiter.report_error(kind);

                if !kind.is_retryable() || attempt >= ctx.retry_attempts {
                    warn!("giving up on {target} after {attempt} retries: {err}");
                    return Err(map_fetch_error(kind, err));
                }

                let delay = calculate_retry_backoff(attempt, kind);
                debug!("retrying {target} (attempt {attempt}) after {delay:?}: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn fetch_once(ctx: &FetcherContext, target: &str) -> anyhow::Result<PageOutcome> {
    let guard = ctx
        .pool
        .acquire()
        .await
        .map_err(|e| anyhow::anyhow!("browser pool: {e}"))?;

    let page = guard
        .browser()
        .new_page("about:blank")
        .await
        .map_err(|e| anyhow::anyhow!("failed to open page: {e}"))?;

    let nav_result = tokio::time::timeout(ctx.page_load_timeout, page.goto(target)).await;
    match nav_result {
        Err(_elapsed) => {
            guard.record_failure();
            anyhow::bail!("navigation to {target} timed out after {:?}", ctx.page_load_timeout);
        }
        Ok(Err(e)) => {
            guard.record_failure();
            anyhow::bail!("navigation to {target} failed: {e}");
        }
        Ok(Ok(_)) => {}
    }

    // Compound wait strategy: prefer network-idle, fall back to a bounded settle wait.
    let wait_result = tokio::time::timeout(ctx.element_wait_timeout, page.wait_for_navigation()).await;
    if wait_result.is_err() {
        debug!("network-idle wait timed out for {target}, falling back to a short settle delay");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let html = page
        .content()
        .await
        .map_err(|e| anyhow::anyhow!("failed to read page content for {target}: {e}"))?;

    guard.record_success();

    Ok(classify_content(html))
}

/// Classifies fetched page content against the anti-bot and not-found marker lists.
/// Anti-bot takes priority: a challenge page can coincidentally contain wording that
/// also matches a not-found marker (e.g. "access denied" pages sometimes echo a 404
/// block), and a challenge wall is the more actionable signal of the two.
fn classify_content(html: String) -> PageOutcome {
    let lowered = html.to_lowercase();
    if ANTI_BOT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return PageOutcome::AntiBot;
    }
    if NOT_FOUND_MARKERS.iter().any(|m| lowered.contains(m)) {
        return PageOutcome::EndOfPagination("not_found_marker");
    }
    PageOutcome::Content(html)
}

fn map_fetch_error(kind: FailureKind, err: anyhow::Error) -> HarvestError {
    match kind {
        FailureKind::AntiBot => HarvestError::AntiBot { url: err.to_string() },
        FailureKind::Browser => HarvestError::BrowserUnavailable(err.to_string()),
        _ => HarvestError::NetworkTransient(err.to_string()),
    }
}

/// `base_delay * 2^attempt * failure_multiplier * (1 ± jitter)`, capped at 30s —
/// ported verbatim from `crawl_engine/orchestrator.rs::calculate_retry_backoff`.
fn calculate_retry_backoff(attempt: u8, failure_kind: FailureKind) -> Duration {
    let exp_delay = BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(5));
    let adjusted_delay = (exp_delay as f64) * failure_kind.delay_multiplier();
    let jitter = rand::rng().random_range(-JITTER_PERCENT..=JITTER_PERCENT);
    let jittered_delay = (adjusted_delay * (1.0 + jitter)) as u64;
    Duration::from_millis(jittered_delay.min(MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paged_url_leaves_page_one_untouched() {
        assert_eq!(paged_url("https://example.com/jobs", 1), "https://example.com/jobs");
    }

    #[test]
    fn paged_url_appends_page_param() {
        let result = paged_url("https://example.com/jobs?remote=true", 3);
        assert!(result.contains("page=3"));
        assert!(result.contains("remote=true"));
    }

    #[test]
    fn backoff_is_capped_at_thirty_seconds() {
        let d = calculate_retry_backoff(10, FailureKind::RateLimited);
        assert!(d <= Duration::from_secs(30));
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let first = calculate_retry_backoff(0, FailureKind::Network).as_millis();
        let second = calculate_retry_backoff(2, FailureKind::Network).as_millis();
        assert!(second >= first);
    }

    #[test]
    fn classifies_challenge_page_as_anti_bot() {
        let html = "<html><body>Checking your browser before accessing example.com</body></html>".to_string();
        assert!(matches!(classify_content(html), PageOutcome::AntiBot));
    }

    #[test]
    fn classifies_not_found_page_as_end_of_pagination() {
        let html = "<html><body>No jobs found for this search</body></html>".to_string();
        assert!(matches!(classify_content(html), PageOutcome::EndOfPagination(_)));
    }

    #[test]
    fn classifies_ordinary_page_as_content() {
        let html = "<html><body><article class=\"job-listing\">Rust Engineer</article></body></html>".to_string();
        assert!(matches!(classify_content(html), PageOutcome::Content(_)));
    }
}
