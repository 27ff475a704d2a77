//! `HarvestConfig`: the input record to `Orchestrator::run` (spec.md §6).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::Policy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserOptions {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    pub custom_args: Vec<String>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            viewport: (1366, 768),
            custom_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    // --- Scheduler (C3) ---
    pub(crate) urls_per_session: usize,
    pub(crate) diversity_mode: Policy,
    pub(crate) active_urls: Vec<String>,

    // --- Orchestrator (C9) / Fetcher (C4) ---
    pub(crate) max_pages: u32,
    pub(crate) max_concurrent: usize,

    // --- Rate Limiter (C1) ---
    pub(crate) requests_per_second: f64,
    pub(crate) burst_limit: u32,

    // --- Checkpoint / Dedup toggles ---
    pub(crate) enable_incremental: bool,
    pub(crate) enable_deduplication: bool,
    pub(crate) force_full: bool,
    pub(crate) similarity_dedup_enabled: bool,

    // --- Cache (C8) ---
    pub(crate) compression_level: u32,
    pub(crate) cache_dir: PathBuf,
    pub(crate) results_dir: PathBuf,
    pub(crate) checkpoint_dir: PathBuf,
    pub(crate) max_cache_size_mb: Option<u64>,
    pub(crate) max_files_per_type: usize,

    // --- Timeouts ---
    pub(crate) page_load_timeout: Duration,
    pub(crate) element_wait_timeout: Duration,
    pub(crate) lease_deadline: Duration,

    // --- Fetcher retry ---
    pub(crate) retry_attempts: u8,
    pub(crate) retry_delay: Duration,

    // --- Browser Pool (C2) ---
    pub(crate) browser: BrowserOptions,
    pub(crate) min_pool_size: usize,
    pub(crate) max_pool_size: usize,
    pub(crate) idle_ttl: Duration,

    #[serde(skip)]
    pub(crate) event_bus_capacity: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            urls_per_session: 10,
            diversity_mode: Policy::Balanced,
            active_urls: Vec::new(),
            max_pages: 5,
            max_concurrent: num_cpus::get().clamp(2, 8),
            requests_per_second: 1.5,
            burst_limit: 3,
            enable_incremental: true,
            enable_deduplication: true,
            force_full: false,
            similarity_dedup_enabled: false,
            compression_level: 6,
            cache_dir: PathBuf::from("./data/cache"),
            results_dir: PathBuf::from("./data/results"),
            checkpoint_dir: PathBuf::from("./data/checkpoints"),
            max_cache_size_mb: Some(500),
            max_files_per_type: 50,
            page_load_timeout: Duration::from_secs(30),
            element_wait_timeout: Duration::from_secs(10),
            lease_deadline: Duration::from_secs(15),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            browser: BrowserOptions::default(),
            min_pool_size: 2,
            max_pool_size: 8,
            idle_ttl: Duration::from_secs(120),
            event_bus_capacity: 256,
        }
    }
}

impl HarvestConfig {
    #[must_use]
    pub fn builder() -> super::builder::HarvestConfigBuilder<()> {
        super::builder::HarvestConfigBuilder::default()
    }

    #[must_use]
    pub fn urls_per_session(&self) -> usize {
        self.urls_per_session
    }
    #[must_use]
    pub fn diversity_mode(&self) -> Policy {
        self.diversity_mode
    }
    #[must_use]
    pub fn active_urls(&self) -> &[String] {
        &self.active_urls
    }
    #[must_use]
    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
    #[must_use]
    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }
    #[must_use]
    pub fn burst_limit(&self) -> u32 {
        self.burst_limit
    }
    #[must_use]
    pub fn enable_incremental(&self) -> bool {
        self.enable_incremental
    }
    #[must_use]
    pub fn enable_deduplication(&self) -> bool {
        self.enable_deduplication
    }
    #[must_use]
    pub fn force_full(&self) -> bool {
        self.force_full
    }
    #[must_use]
    pub fn similarity_dedup_enabled(&self) -> bool {
        self.similarity_dedup_enabled
    }
    #[must_use]
    pub fn compression_level(&self) -> u32 {
        self.compression_level
    }
    #[must_use]
    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }
    #[must_use]
    pub fn results_dir(&self) -> &PathBuf {
        &self.results_dir
    }
    #[must_use]
    pub fn checkpoint_dir(&self) -> &PathBuf {
        &self.checkpoint_dir
    }
    #[must_use]
    pub fn max_cache_size_mb(&self) -> Option<u64> {
        self.max_cache_size_mb
    }
    #[must_use]
    pub fn max_files_per_type(&self) -> usize {
        self.max_files_per_type
    }
    #[must_use]
    pub fn page_load_timeout(&self) -> Duration {
        self.page_load_timeout
    }
    #[must_use]
    pub fn element_wait_timeout(&self) -> Duration {
        self.element_wait_timeout
    }
    #[must_use]
    pub fn lease_deadline(&self) -> Duration {
        self.lease_deadline
    }
    #[must_use]
    pub fn retry_attempts(&self) -> u8 {
        self.retry_attempts
    }
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
    #[must_use]
    pub fn browser(&self) -> &BrowserOptions {
        &self.browser
    }
    #[must_use]
    pub fn min_pool_size(&self) -> usize {
        self.min_pool_size
    }
    #[must_use]
    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }
    #[must_use]
    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }
    #[must_use]
    pub fn event_bus_capacity(&self) -> usize {
        self.event_bus_capacity
    }
}
