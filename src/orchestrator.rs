//! Session Orchestrator (C9): `Run(config, ctx)` — the top-level per-session
//! coroutine that ties the Scheduler, Fetcher, Extractor, Deduplicator, Checkpoint,
//! and Cache together, per spec.md §4.9.
//!
//! Grounded on `crawl_engine/orchestrator.rs`'s `FuturesUnordered` + `Semaphore`
//! concurrent-worker loop, narrowed from breadth-first link-graph crawling to
//! fixed-catalog per-URL pagination (no queue/visited-set, since the unit of work is
//! "the next page of catalog URL X" rather than "the next discovered link").
//! Cancellation uses `tokio::sync::watch` since `tokio-util`'s `CancellationToken`
//! is not in the teacher's dependency stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{info, warn};
use tokio::sync::{watch, Semaphore};

use crate::browser_pool::{BrowserPool, BrowserPoolConfig};
use crate::cache::Cache;
use crate::checkpoint;
use crate::config::HarvestConfig;
use crate::dedup;
use crate::error::UrlError;
use crate::events::{EventBus, HarvestEvent};
use crate::extractor::{self, ExtractionContext};
use crate::fetcher::{self, FetcherContext, PageOutcome};
use crate::model::{CatalogUrl, Checkpoint, RunOutcome, SessionResult, UrlMetrics};
use crate::rate_limiter::RateLimiter;
use crate::scheduler;

pub struct SessionContext {
    pub cache: Arc<Cache>,
    pub event_bus: Arc<EventBus>,
    pub cancel: watch::Receiver<bool>,
}

/// Runs one harvest session end-to-end and returns its `SessionResult`.
pub async fn run(config: &HarvestConfig, catalog: &[CatalogUrl], ctx: SessionContext) -> SessionResult {
    use tracing::Instrument;
    run_inner(config, catalog, ctx).instrument(tracing::info_span!("session")).await
}

async fn run_inner(config: &HarvestConfig, catalog: &[CatalogUrl], ctx: SessionContext) -> SessionResult {
    let started_at = chrono::Utc::now();
    let start_instant = Instant::now();
    let rng_seed = chrono::Utc::now().timestamp_millis() as u64;

    let selected = scheduler::select_urls(
        catalog,
        config.urls_per_session(),
        config.diversity_mode(),
        &[],
        rng_seed,
    );
    ctx.event_bus.publish(HarvestEvent::SessionStarted { urls: selected.len(), timestamp: started_at });

    let pool = BrowserPool::new(BrowserPoolConfig {
        min_pool_size: config.min_pool_size(),
        max_pool_size: config.max_pool_size(),
        keepalive_interval: std::time::Duration::from_secs(30),
        idle_timeout: config.idle_ttl(),
        lease_deadline: config.lease_deadline(),
        browser: config.browser().clone(),
    });
    if let Err(e) = pool.start().await {
        let finished_at = chrono::Utc::now();
        return SessionResult {
            started_at,
            finished_at,
            new_records: Vec::new(),
            updated_records: Vec::new(),
            url_metrics: Vec::new(),
            wall_clock_ms: start_instant.elapsed().as_millis() as u64,
            errors: Vec::new(),
            fatal_error: Some(format!("failed to start browser pool: {e}")),
            scheduler_seed: rng_seed,
        };
    }

    let rate_limiter = Arc::new(RateLimiter::new(config.requests_per_second(), config.burst_limit()));
    let steady_state_floor = std::time::Duration::from_secs_f64(1.0 / config.requests_per_second().max(0.01));

    let fetcher_ctx = Arc::new(FetcherContext {
        pool: Arc::clone(&pool),
        rate_limiter: Arc::clone(&rate_limiter),
        page_load_timeout: config.page_load_timeout(),
        element_wait_timeout: config.element_wait_timeout(),
        retry_attempts: config.retry_attempts(),
        steady_state_floor,
    });

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent()));
    let total_pages = Arc::new(AtomicUsize::new(0));
    let mut tasks = FuturesUnordered::new();

    for url in selected {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => continue,
        };
        let fetcher_ctx = Arc::clone(&fetcher_ctx);
        let cache = Arc::clone(&ctx.cache);
        let event_bus = Arc::clone(&ctx.event_bus);
        let cancel = ctx.cancel.clone();
        let total_pages = Arc::clone(&total_pages);
        let checkpoint_dir = config.checkpoint_dir().clone();
        let force_full = config.force_full();
        let enable_incremental = config.enable_incremental();
        let enable_deduplication = config.enable_deduplication();
        let similarity_dedup_enabled = config.similarity_dedup_enabled();
        let max_pages = config.max_pages();

        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            harvest_url(UrlRunInputs {
                url,
                fetcher_ctx,
                cache,
                event_bus,
                cancel,
                total_pages,
                checkpoint_dir,
                force_full,
                enable_incremental,
                enable_deduplication,
                similarity_dedup_enabled,
                max_pages,
            })
            .await
        }));
    }

    let mut new_records = Vec::new();
    let mut updated_records = Vec::new();
    let mut url_metrics = Vec::new();
    let mut errors = Vec::new();
    let mut new_count = 0usize;
    let mut updated_count = 0usize;
    let mut duplicate_count = 0usize;

    while let Some(joined) = tasks.next().await {
        match joined {
            Ok(outcome) => {
                new_count += outcome.metrics.new_jobs;
                updated_count += outcome.metrics.updated_jobs;
                duplicate_count += outcome.metrics.duplicate_jobs;
                new_records.extend(outcome.new_records);
                updated_records.extend(outcome.updated_records);
                url_metrics.push(outcome.metrics);
                errors.extend(outcome.errors);
            }
            Err(e) => warn!("a url harvest task panicked: {e}"),
        }
    }

    if let Err(e) = pool.shutdown().await {
        warn!("browser pool shutdown reported an error: {e}");
    }

    let finished_at = chrono::Utc::now();
    let duration = start_instant.elapsed();
    ctx.event_bus.publish(HarvestEvent::SessionCompleted {
        total_pages: total_pages.load(Ordering::Relaxed),
        new: new_count,
        updated: updated_count,
        duplicate: duplicate_count,
        duration,
        timestamp: finished_at,
    });

    SessionResult {
        started_at,
        finished_at,
        new_records,
        updated_records,
        url_metrics,
        wall_clock_ms: duration.as_millis() as u64,
        errors,
        fatal_error: None,
        scheduler_seed: rng_seed,
    }
}

struct UrlRunInputs {
    url: String,
    fetcher_ctx: Arc<FetcherContext>,
    cache: Arc<Cache>,
    event_bus: Arc<EventBus>,
    cancel: watch::Receiver<bool>,
    total_pages: Arc<AtomicUsize>,
    checkpoint_dir: std::path::PathBuf,
    force_full: bool,
    enable_incremental: bool,
    enable_deduplication: bool,
    similarity_dedup_enabled: bool,
    max_pages: u32,
}

struct UrlRunOutcome {
    new_records: Vec<crate::model::JobRecord>,
    updated_records: Vec<crate::model::JobRecord>,
    metrics: UrlMetrics,
    errors: Vec<UrlError>,
}

async fn harvest_url(mut inputs: UrlRunInputs) -> UrlRunOutcome {
    let started = Instant::now();
    inputs.event_bus.publish(HarvestEvent::UrlStarted { url: inputs.url.clone(), timestamp: chrono::Utc::now() });

    let mut checkpoint = if inputs.enable_incremental {
        checkpoint::load_checkpoint(&inputs.checkpoint_dir, &inputs.url, inputs.force_full)
            .await
            .unwrap_or_else(|_| Checkpoint::empty(inputs.url.clone()))
    } else {
        Checkpoint::empty(inputs.url.clone())
    };

    let mut new_records = Vec::new();
    let mut updated_records = Vec::new();
    let mut errors = Vec::new();
    let mut outcome = RunOutcome::default();
    let mut pages_fetched = 0u32;

    for page_no in 1..=inputs.max_pages {
        if *inputs.cancel.borrow() {
            inputs.event_bus.publish(HarvestEvent::Cancelled);
            break;
        }

        match fetcher::fetch_page(&inputs.fetcher_ctx, &inputs.url, page_no).await {
            Ok(PageOutcome::EndOfPagination(reason)) => {
                inputs.event_bus.publish(HarvestEvent::EndOfPagination { url: inputs.url.clone(), page_no, reason });
                break;
            }
            Ok(PageOutcome::Content(html)) => {
                pages_fetched += 1;
                inputs.total_pages.fetch_add(1, Ordering::Relaxed);

                let extraction_ctx = ExtractionContext { source_url: &inputs.url };
                let records = extractor::extract_records(&html, &extraction_ctx);

                if records.is_empty() && page_no > 1 {
                    inputs.event_bus.publish(HarvestEvent::EndOfPagination {
                        url: inputs.url.clone(),
                        page_no,
                        reason: "zero_records",
                    });
                    break;
                }

                inputs.event_bus.publish(HarvestEvent::PageFetched {
                    url: inputs.url.clone(),
                    page_no,
                    records: records.len(),
                    timestamp: chrono::Utc::now(),
                });

                if inputs.enable_deduplication {
                    let mut existing: HashMap<_, _> = HashMap::new();
                    for record in &records {
                        if let Some(entry) = inputs.cache.get(&record.fingerprint).await {
                            existing.insert(record.fingerprint, entry.latest);
                        }
                    }
                    let mut result = dedup::partition_batch(&existing, records);
                    if inputs.similarity_dedup_enabled {
                        result.new = dedup::collapse_similar(result.new);
                    }

                    outcome.new += result.new.len();
                    outcome.updated += result.updated.len();
                    outcome.duplicate += result.duplicate_count;

                    for record in result.new.iter().chain(result.updated.iter()) {
                        checkpoint.fingerprints_seen.insert(record.fingerprint);
                        if let Err(e) = inputs.cache.put(record.clone()).await {
                            errors.push(UrlError {
                                url: inputs.url.clone(),
                                page_no,
                                message: e.to_string(),
                            });
                        }
                    }
                    new_records.extend(result.new);
                    updated_records.extend(result.updated);
                } else {
                    outcome.new += records.len();
                    for record in &records {
                        checkpoint.fingerprints_seen.insert(record.fingerprint);
                        if let Err(e) = inputs.cache.put(record.clone()).await {
                            errors.push(UrlError {
                                url: inputs.url.clone(),
                                page_no,
                                message: e.to_string(),
                            });
                        }
                    }
                    new_records.extend(records);
                }
            }
            Err(e) => {
                if let crate::error::HarvestError::AntiBot { .. } = &e {
                    inputs.event_bus.publish(HarvestEvent::AntiBotDetected { url: inputs.url.clone() });
                }
                inputs.event_bus.publish(HarvestEvent::RetryExhausted {
                    url: inputs.url.clone(),
                    page_no,
                    error: e.to_string(),
                });
                errors.push(UrlError { url: inputs.url.clone(), page_no, message: e.to_string() });
                break;
            }
        }
    }

    if inputs.enable_incremental && pages_fetched > 0 {
        let score = crate::scheduler::recompute_performance_score(
            1,
            outcome.new as u32,
            (outcome.new + outcome.updated + outcome.duplicate).max(1) as u32,
            started.elapsed().as_secs_f64(),
            errors.len() as u32,
        );
        let fingerprints_seen = checkpoint.fingerprints_seen.clone();
        checkpoint::apply_outcome(&mut checkpoint, fingerprints_seen, outcome, score);
        if let Err(e) = checkpoint::commit_checkpoint(&inputs.checkpoint_dir, &checkpoint).await {
            warn!("failed to commit checkpoint for {}: {e}", inputs.url);
        } else {
            inputs.event_bus.publish(HarvestEvent::CheckpointCommitted {
                url: inputs.url.clone(),
                new: outcome.new,
                updated: outcome.updated,
                duplicate: outcome.duplicate,
            });
        }
    }

    info!(
        "harvested {}: {} new, {} updated, {} duplicate over {} pages",
        inputs.url, outcome.new, outcome.updated, outcome.duplicate, pages_fetched
    );

    UrlRunOutcome {
        new_records,
        updated_records,
        metrics: UrlMetrics {
            url: inputs.url,
            pages_fetched,
            new_jobs: outcome.new,
            updated_jobs: outcome.updated,
            duplicate_jobs: outcome.duplicate,
            errors: errors.len(),
            duration_ms: started.elapsed().as_millis() as u64,
        },
        errors,
    }
}
