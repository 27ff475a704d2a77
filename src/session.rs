//! Session filesystem layout: result-file rotation and catalog persistence
//! (spec.md §6). Grounded on the teacher's oldest-first eviction in
//! `mcp/manager/search_cache.rs` (track each candidate's timestamp, drop the
//! stalest once a cap is exceeded), adapted from an in-memory LRU to on-disk files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::model::{CatalogUrl, SessionResult};

/// Writes `result` to `resultsDir/<timestamp>.json`, then deletes the oldest files
/// in that directory beyond `max_files_per_type` (spec.md §6 "keep the most recent
/// `maxFilesPerType` files").
pub async fn write_session_result(results_dir: &Path, result: &SessionResult, max_files_per_type: usize) -> Result<PathBuf> {
    tokio::fs::create_dir_all(results_dir).await.context("failed to create results directory")?;

    let filename = format!("{}.json", result.started_at.format("%Y-%m-%d-%H%M%S"));
    let path = results_dir.join(&filename);
    let json = serde_json::to_vec_pretty(result).context("failed to serialize session result")?;
    tokio::fs::write(&path, json).await.context("failed to write session result file")?;

    rotate(results_dir, max_files_per_type).await?;
    Ok(path)
}

async fn rotate(dir: &Path, max_files: usize) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await.context("failed to list results directory")?;
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    while let Some(entry) = entries.next_entry().await.context("failed to read results directory entry")? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let modified = entry.metadata().await.and_then(|m| m.modified()).unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        files.push((path, modified));
    }

    if files.len() <= max_files {
        return Ok(());
    }

    files.sort_by_key(|(_, modified)| *modified);
    let overflow = files.len() - max_files;
    for (path, _) in files.into_iter().take(overflow) {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("failed to prune old results file {}: {e}", path.display());
        } else {
            debug!("pruned old results file {}", path.display());
        }
    }
    Ok(())
}

/// Loads the persisted catalog (URL pool plus per-URL scheduling history) from
/// `<storage_root>/catalog.json`, or an empty catalog if absent/corrupt.
pub async fn load_catalog(path: &Path) -> Vec<CatalogUrl> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("catalog at {} is corrupt ({e}); starting with an empty catalog", path.display());
            Vec::new()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!("failed to read catalog at {}: {e}; starting with an empty catalog", path.display());
            Vec::new()
        }
    }
}

/// Atomically persists `catalog` back to `path`, preserving the Recorder's
/// (C10) updated `performance_score`/`hourly_stats`/`daily_stats` for next session.
pub async fn save_catalog(path: &Path, catalog: &[CatalogUrl]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.context("failed to create catalog directory")?;
    }
    let json = serde_json::to_vec_pretty(catalog).context("failed to serialize catalog")?;
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut temp_file = tempfile::NamedTempFile::new_in(&dir).context("failed to create catalog temp file")?;
        use std::io::Write;
        temp_file.write_all(&json).context("failed to write catalog temp file")?;
        temp_file.persist(&path).context("failed to persist catalog")?;
        Ok(())
    })
    .await
    .context("catalog save task panicked")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UrlMetrics;

    fn sample_result() -> SessionResult {
        SessionResult {
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
            new_records: Vec::new(),
            updated_records: Vec::new(),
            url_metrics: Vec::<UrlMetrics>::new(),
            wall_clock_ms: 100,
            errors: Vec::new(),
            fatal_error: None,
            scheduler_seed: 1,
        }
    }

    #[tokio::test]
    async fn writes_and_reads_back_a_result_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = sample_result();
        let path = write_session_result(dir.path(), &result, 50).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn rotation_prunes_beyond_cap() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..5 {
            let mut result = sample_result();
            result.started_at = chrono::Utc::now() + chrono::Duration::milliseconds(rand::random::<u8>() as i64);
            write_session_result(dir.path(), &result, 3).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert!(count <= 3);
    }

    #[tokio::test]
    async fn missing_catalog_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = load_catalog(&dir.path().join("catalog.json")).await;
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = vec![CatalogUrl::new("https://example.com/a", crate::model::UrlCategory::Remote)];
        save_catalog(&path, &catalog).await.unwrap();
        let loaded = load_catalog(&path).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].url, "https://example.com/a");
    }
}
