//! Type-safe builder for `HarvestConfig` using the typestate pattern
//! (grounded on `config/builder.rs`'s `WithStorageDir`/`WithStartUrl`/`Complete`
//! phantom-typed states).

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::scheduler::Policy;

use super::types::{BrowserOptions, HarvestConfig};

pub struct WithStorageRoot;
pub struct WithCatalog;
pub struct Complete;

pub struct HarvestConfigBuilder<State = ()> {
    storage_root: Option<PathBuf>,
    active_urls: Vec<String>,
    urls_per_session: usize,
    diversity_mode: Policy,
    max_pages: u32,
    max_concurrent: usize,
    requests_per_second: f64,
    burst_limit: u32,
    enable_incremental: bool,
    enable_deduplication: bool,
    force_full: bool,
    similarity_dedup_enabled: bool,
    compression_level: u32,
    max_cache_size_mb: Option<u64>,
    max_files_per_type: usize,
    page_load_timeout: Duration,
    element_wait_timeout: Duration,
    lease_deadline: Duration,
    retry_attempts: u8,
    retry_delay: Duration,
    browser: BrowserOptions,
    min_pool_size: usize,
    max_pool_size: usize,
    idle_ttl: Duration,
    event_bus_capacity: usize,
    _phantom: PhantomData<State>,
}

impl Default for HarvestConfigBuilder<()> {
    fn default() -> Self {
        let d = HarvestConfig::default();
        Self {
            storage_root: None,
            active_urls: d.active_urls,
            urls_per_session: d.urls_per_session,
            diversity_mode: d.diversity_mode,
            max_pages: d.max_pages,
            max_concurrent: d.max_concurrent,
            requests_per_second: d.requests_per_second,
            burst_limit: d.burst_limit,
            enable_incremental: d.enable_incremental,
            enable_deduplication: d.enable_deduplication,
            force_full: d.force_full,
            similarity_dedup_enabled: d.similarity_dedup_enabled,
            compression_level: d.compression_level,
            max_cache_size_mb: d.max_cache_size_mb,
            max_files_per_type: d.max_files_per_type,
            page_load_timeout: d.page_load_timeout,
            element_wait_timeout: d.element_wait_timeout,
            lease_deadline: d.lease_deadline,
            retry_attempts: d.retry_attempts,
            retry_delay: d.retry_delay,
            browser: d.browser,
            min_pool_size: d.min_pool_size,
            max_pool_size: d.max_pool_size,
            idle_ttl: d.idle_ttl,
            event_bus_capacity: d.event_bus_capacity,
            _phantom: PhantomData,
        }
    }
}

impl HarvestConfigBuilder<()> {
    /// Set the root under which `cacheDir`/`resultsDir`/`checkpointDir` are derived
    /// as `<root>/cache`, `<root>/results`, `<root>/checkpoints` unless overridden.
    #[must_use]
    pub fn storage_root(self, dir: impl Into<PathBuf>) -> HarvestConfigBuilder<WithStorageRoot> {
        HarvestConfigBuilder {
            storage_root: Some(dir.into()),
            active_urls: self.active_urls,
            urls_per_session: self.urls_per_session,
            diversity_mode: self.diversity_mode,
            max_pages: self.max_pages,
            max_concurrent: self.max_concurrent,
            requests_per_second: self.requests_per_second,
            burst_limit: self.burst_limit,
            enable_incremental: self.enable_incremental,
            enable_deduplication: self.enable_deduplication,
            force_full: self.force_full,
            similarity_dedup_enabled: self.similarity_dedup_enabled,
            compression_level: self.compression_level,
            max_cache_size_mb: self.max_cache_size_mb,
            max_files_per_type: self.max_files_per_type,
            page_load_timeout: self.page_load_timeout,
            element_wait_timeout: self.element_wait_timeout,
            lease_deadline: self.lease_deadline,
            retry_attempts: self.retry_attempts,
            retry_delay: self.retry_delay,
            browser: self.browser,
            min_pool_size: self.min_pool_size,
            max_pool_size: self.max_pool_size,
            idle_ttl: self.idle_ttl,
            event_bus_capacity: self.event_bus_capacity,
            _phantom: PhantomData,
        }
    }
}

impl HarvestConfigBuilder<WithStorageRoot> {
    /// Provide the catalog URLs this session may draw from (for `custom` policy) or
    /// simply the session's URL pool size driver; required even when the policy
    /// doesn't consume it directly, so a caller can't build a config with nowhere to
    /// fetch from.
    #[must_use]
    pub fn catalog_urls(
        mut self,
        urls: Vec<String>,
    ) -> HarvestConfigBuilder<WithCatalog> {
        self.active_urls = urls;
        HarvestConfigBuilder {
            storage_root: self.storage_root,
            active_urls: self.active_urls,
            urls_per_session: self.urls_per_session,
            diversity_mode: self.diversity_mode,
            max_pages: self.max_pages,
            max_concurrent: self.max_concurrent,
            requests_per_second: self.requests_per_second,
            burst_limit: self.burst_limit,
            enable_incremental: self.enable_incremental,
            enable_deduplication: self.enable_deduplication,
            force_full: self.force_full,
            similarity_dedup_enabled: self.similarity_dedup_enabled,
            compression_level: self.compression_level,
            max_cache_size_mb: self.max_cache_size_mb,
            max_files_per_type: self.max_files_per_type,
            page_load_timeout: self.page_load_timeout,
            element_wait_timeout: self.element_wait_timeout,
            lease_deadline: self.lease_deadline,
            retry_attempts: self.retry_attempts,
            retry_delay: self.retry_delay,
            browser: self.browser,
            min_pool_size: self.min_pool_size,
            max_pool_size: self.max_pool_size,
            idle_ttl: self.idle_ttl,
            event_bus_capacity: self.event_bus_capacity,
            _phantom: PhantomData,
        }
    }
}

impl HarvestConfigBuilder<WithCatalog> {
    /// # Errors
    /// Returns `Config`-class errors (surfaced as `anyhow::Error` here, mapped to
    /// `HarvestError::Config` at the orchestrator boundary) when required fields are
    /// missing or out of range.
    pub fn build(self) -> Result<HarvestConfig> {
        let storage_root = self
            .storage_root
            .ok_or_else(|| anyhow!("storage_root is required"))?;
        if self.min_pool_size > self.max_pool_size {
            return Err(anyhow!("min_pool_size must be <= max_pool_size"));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(anyhow!("compression_level must be in 1..=9"));
        }

        Ok(HarvestConfig {
            urls_per_session: self.urls_per_session,
            diversity_mode: self.diversity_mode,
            active_urls: self.active_urls,
            max_pages: self.max_pages,
            max_concurrent: self.max_concurrent,
            requests_per_second: self.requests_per_second,
            burst_limit: self.burst_limit,
            enable_incremental: self.enable_incremental,
            enable_deduplication: self.enable_deduplication,
            force_full: self.force_full,
            similarity_dedup_enabled: self.similarity_dedup_enabled,
            compression_level: self.compression_level,
            cache_dir: storage_root.join("cache"),
            results_dir: storage_root.join("results"),
            checkpoint_dir: storage_root.join("checkpoints"),
            max_cache_size_mb: self.max_cache_size_mb,
            max_files_per_type: self.max_files_per_type,
            page_load_timeout: self.page_load_timeout,
            element_wait_timeout: self.element_wait_timeout,
            lease_deadline: self.lease_deadline,
            retry_attempts: self.retry_attempts,
            retry_delay: self.retry_delay,
            browser: self.browser,
            min_pool_size: self.min_pool_size,
            max_pool_size: self.max_pool_size,
            idle_ttl: self.idle_ttl,
            event_bus_capacity: self.event_bus_capacity,
        })
    }
}

/// Builder methods available at any state.
impl<State> HarvestConfigBuilder<State> {
    #[must_use]
    pub fn urls_per_session(mut self, n: usize) -> Self {
        self.urls_per_session = n;
        self
    }
    #[must_use]
    pub fn diversity_mode(mut self, policy: Policy) -> Self {
        self.diversity_mode = policy;
        self
    }
    #[must_use]
    pub fn max_pages(mut self, n: u32) -> Self {
        self.max_pages = n;
        self
    }
    #[must_use]
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }
    #[must_use]
    pub fn requests_per_second(mut self, rps: f64) -> Self {
        self.requests_per_second = rps;
        self
    }
    #[must_use]
    pub fn burst_limit(mut self, n: u32) -> Self {
        self.burst_limit = n;
        self
    }
    #[must_use]
    pub fn enable_incremental(mut self, v: bool) -> Self {
        self.enable_incremental = v;
        self
    }
    #[must_use]
    pub fn enable_deduplication(mut self, v: bool) -> Self {
        self.enable_deduplication = v;
        self
    }
    #[must_use]
    pub fn force_full(mut self, v: bool) -> Self {
        self.force_full = v;
        self
    }
    #[must_use]
    pub fn similarity_dedup_enabled(mut self, v: bool) -> Self {
        self.similarity_dedup_enabled = v;
        self
    }
    #[must_use]
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }
    #[must_use]
    pub fn max_cache_size_mb(mut self, mb: u64) -> Self {
        self.max_cache_size_mb = Some(mb);
        self
    }
    #[must_use]
    pub fn max_files_per_type(mut self, n: usize) -> Self {
        self.max_files_per_type = n;
        self
    }
    #[must_use]
    pub fn page_load_timeout(mut self, d: Duration) -> Self {
        self.page_load_timeout = d;
        self
    }
    #[must_use]
    pub fn element_wait_timeout(mut self, d: Duration) -> Self {
        self.element_wait_timeout = d;
        self
    }
    #[must_use]
    pub fn lease_deadline(mut self, d: Duration) -> Self {
        self.lease_deadline = d;
        self
    }
    #[must_use]
    pub fn retry_attempts(mut self, n: u8) -> Self {
        self.retry_attempts = n;
        self
    }
    #[must_use]
    pub fn retry_delay(mut self, d: Duration) -> Self {
        self.retry_delay = d;
        self
    }
    #[must_use]
    pub fn browser(mut self, b: BrowserOptions) -> Self {
        self.browser = b;
        self
    }
    #[must_use]
    pub fn pool_size(mut self, min: usize, max: usize) -> Self {
        self.min_pool_size = min;
        self.max_pool_size = max;
        self
    }
    #[must_use]
    pub fn idle_ttl(mut self, d: Duration) -> Self {
        self.idle_ttl = d;
        self
    }
    #[must_use]
    pub fn event_bus_capacity(mut self, n: usize) -> Self {
        self.event_bus_capacity = n;
        self
    }
}

/// Derive a stable checkpoint filename from a catalog URL (used by C7 and by this
/// module's own path-normalization; kept alongside the builder because both the
/// config's `checkpoint_dir` and the checkpoint module agree on this convention).
#[must_use]
pub fn checkpoint_path(checkpoint_dir: &Path, url: &str) -> PathBuf {
    let hash = xxhash_rust::xxh3::xxh3_64(url.as_bytes());
    checkpoint_dir.join(format!("{hash:016x}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_storage_root() {
        let cfg = HarvestConfig::builder()
            .storage_root("/tmp/harvest-test")
            .catalog_urls(vec!["https://example.com/a".into()])
            .build()
            .expect("build should succeed with required fields set");
        assert_eq!(cfg.cache_dir(), &PathBuf::from("/tmp/harvest-test/cache"));
        assert_eq!(cfg.active_urls(), &["https://example.com/a".to_string()]);
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let err = HarvestConfig::builder()
            .storage_root("/tmp/harvest-test")
            .catalog_urls(vec![])
            .pool_size(10, 2)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("min_pool_size"));
    }
}
