//! Incremental Checkpoint (C7): per-URL persisted `fingerprints_seen` set enabling
//! incremental runs, per spec.md §4.7.
//!
//! The atomic write-then-rename is grounded on
//! `content_saver/compression.rs::save_compressed_file`'s
//! `NamedTempFile::new_in` + `spawn_blocking` + `.persist()` pattern, simplified to
//! plain (uncompressed) JSON since checkpoints are small and read on every session
//! start.

use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::config::builder::checkpoint_path;
use crate::model::{Checkpoint, RunOutcome};

/// Loads the checkpoint for `url`, or an empty one if absent, corrupt, or
/// `force_full` bypasses it entirely (spec.md §4.7).
pub async fn load_checkpoint(checkpoint_dir: &Path, url: &str, force_full: bool) -> Result<Checkpoint> {
    if force_full {
        debug!("force_full set, skipping checkpoint load for {url}");
        return Ok(Checkpoint::empty(url));
    }

    let path = checkpoint_path(checkpoint_dir, url);
    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Checkpoint::empty(url)),
        Err(e) => return Err(e).context(format!("failed to read checkpoint at {}", path.display())),
    };

    match serde_json::from_slice::<Checkpoint>(&bytes) {
        Ok(checkpoint) => Ok(checkpoint),
        Err(e) => {
            warn!("checkpoint at {} is corrupt ({e}); starting fresh", path.display());
            Ok(Checkpoint::empty(url))
        }
    }
}

/// Atomically persists `checkpoint`, replacing whatever was previously on disk for
/// this URL.
pub async fn commit_checkpoint(checkpoint_dir: &Path, checkpoint: &Checkpoint) -> Result<()> {
    tokio::fs::create_dir_all(checkpoint_dir)
        .await
        .context("failed to create checkpoint directory")?;

    let path = checkpoint_path(checkpoint_dir, &checkpoint.url);
    let json = serde_json::to_vec_pretty(checkpoint).context("failed to serialize checkpoint")?;
    let dir = checkpoint_dir.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut temp_file = NamedTempFile::new_in(&dir).context("failed to create checkpoint temp file")?;
        use std::io::Write;
        temp_file.write_all(&json).context("failed to write checkpoint temp file")?;
        temp_file.persist(&path).context("failed to persist checkpoint")?;
        Ok(())
    })
    .await
    .context("checkpoint commit task panicked")??;

    Ok(())
}

/// Folds a run's outcome into `checkpoint`, ready for [`commit_checkpoint`].
pub fn apply_outcome(
    checkpoint: &mut Checkpoint,
    new_fingerprints: impl IntoIterator<Item = crate::model::Fingerprint>,
    outcome: RunOutcome,
    performance_score: f64,
) {
    checkpoint.fingerprints_seen.extend(new_fingerprints);
    checkpoint.last_run_at = Some(chrono::Utc::now());
    checkpoint.last_outcome = outcome;
    checkpoint.performance_score_at_commit = performance_score;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_checkpoint_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = load_checkpoint(dir.path(), "https://example.com/a", false).await.unwrap();
        assert!(checkpoint.fingerprints_seen.is_empty());
    }

    #[tokio::test]
    async fn force_full_bypasses_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = Checkpoint::empty("https://example.com/a");
        checkpoint.fingerprints_seen.insert(crate::model::Fingerprint::from_u128(1));
        commit_checkpoint(dir.path(), &checkpoint).await.unwrap();

        let loaded = load_checkpoint(dir.path(), "https://example.com/a", true).await.unwrap();
        assert!(loaded.fingerprints_seen.is_empty());
    }

    #[tokio::test]
    async fn commit_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = Checkpoint::empty("https://example.com/a");
        checkpoint.fingerprints_seen.insert(crate::model::Fingerprint::from_u128(42));
        commit_checkpoint(dir.path(), &checkpoint).await.unwrap();

        let loaded = load_checkpoint(dir.path(), "https://example.com/a", false).await.unwrap();
        assert_eq!(loaded.fingerprints_seen.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "https://example.com/a");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let loaded = load_checkpoint(dir.path(), "https://example.com/a", false).await.unwrap();
        assert!(loaded.fingerprints_seen.is_empty());
    }
}
