//! CLI entry point: builds a `HarvestConfig`, loads the catalog, runs one
//! harvest session, persists results/catalog, and prints a one-line JSON
//! summary to stdout (spec.md §6 — the engine itself never writes to the
//! terminal beyond this summary; progress is observable via `HarvestEvent`s).

use std::path::PathBuf;

use anyhow::{Context, Result};
use job_harvester::config::HarvestConfig;
use job_harvester::{events, logging, orchestrator, recorder, session};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let storage_root = std::env::var("HARVEST_STORAGE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"));
    let force_full = std::env::var("HARVEST_FORCE_FULL").is_ok();

    let catalog_path = storage_root.join("catalog.json");
    let mut catalog = session::load_catalog(&catalog_path).await;
    if catalog.is_empty() {
        log::warn!("catalog at {} is empty; nothing to harvest", catalog_path.display());
    }

    let config = HarvestConfig::builder()
        .storage_root(storage_root)
        .catalog_urls(catalog.iter().map(|c| c.url.clone()).collect())
        .force_full(force_full)
        .build()
        .context("failed to build harvest configuration")?;

    let cache = std::sync::Arc::new(
        job_harvester::Cache::open(config.cache_dir(), 10_000)
            .await
            .context("failed to open cache")?,
    );
    let event_bus = std::sync::Arc::new(events::EventBus::new(config.event_bus_capacity()));
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let mut log_subscriber = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = log_subscriber.recv().await {
            log::info!("{event:?}");
        }
    });

    let ctx = orchestrator::SessionContext {
        cache,
        event_bus,
        cancel: cancel_rx,
    };

    let result = orchestrator::run(&config, &catalog, ctx).await;

    let completed_metrics: Vec<_> = result.url_metrics.iter().filter(|m| m.pages_fetched > 0).cloned().collect();
    recorder::record_session(&mut catalog, &completed_metrics, result.finished_at);
    if let Err(e) = session::save_catalog(&catalog_path, &catalog).await {
        log::warn!("failed to persist catalog: {e}");
    }

    let summary = serde_json::json!({
        "new": result.new_records.len(),
        "updated": result.updated_records.len(),
        "urls": result.url_metrics.len(),
        "errors": result.errors.len(),
        "wall_clock_ms": result.wall_clock_ms,
        "fatal_error": result.fatal_error,
    });

    session::write_session_result(config.results_dir(), &result, config.max_files_per_type())
        .await
        .context("failed to write session result")?;

    println!("{summary}");
    Ok(())
}
