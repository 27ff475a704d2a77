//! Pre-warmed Chrome browser pool with dynamic scaling (C2).
//!
//! Kept close to the teacher's `BrowserPool`: `min`/`max` sizing, the
//! `PooledBrowserGuard` RAII return-on-drop, and the `scaler_loop`/`keepalive_loop`
//! background tasks. Narrowed per spec.md §4.2: `acquire()` is bounded by a
//! `lease_deadline` instead of looping forever, surfacing `HarvestError::Exhausted`
//! once the deadline passes, and a page that fails its liveness check twice in a row
//! is recycled (closed) instead of requeued.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chromiumoxide::browser::Browser;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::BrowserOptions;
use crate::error::HarvestError;

#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
    pub lease_deadline: Duration,
    pub browser: BrowserOptions,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 2,
            max_pool_size: 10,
            keepalive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            lease_deadline: Duration::from_secs(15),
            browser: BrowserOptions::default(),
        }
    }
}

/// RAII wrapper for a pooled browser instance.
#[derive(Debug)]
pub struct PooledBrowserWrapper {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
    user_data_dir: Option<PathBuf>,
}

impl PooledBrowserWrapper {
    fn new(browser: Browser, handler: JoinHandle<()>, user_data_dir: PathBuf) -> Self {
        Self {
            browser: Arc::new(browser),
            handler,
            user_data_dir: Some(user_data_dir),
        }
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    pub fn browser_arc(&self) -> Arc<Browser> {
        Arc::clone(&self.browser)
    }

    fn browser_mut(&mut self) -> Option<&mut Browser> {
        Arc::get_mut(&mut self.browser)
    }

    fn cleanup_temp_dir(&mut self) {
        if let Some(path) = self.user_data_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("failed to clean up temp directory {}: {e}", path.display());
            }
        }
    }
}

impl Drop for PooledBrowserWrapper {
    fn drop(&mut self) {
        self.handler.abort();
        if self.user_data_dir.is_some() {
            self.cleanup_temp_dir();
        }
    }
}

/// A browser instance with pool metadata.
#[derive(Debug)]
pub struct PooledBrowser {
    pub id: u64,
    pub wrapper: PooledBrowserWrapper,
    pub created_at: Instant,
    pub last_used: Instant,
    pub last_health_check: Instant,
    /// Consecutive liveness-check (or caller-reported) failures. A browser reaching
    /// 2 is recycled rather than requeued — spec.md §4.2.
    consecutive_failures: AtomicU8,
}

impl PooledBrowser {
    fn new(id: u64, wrapper: PooledBrowserWrapper) -> Self {
        let now = Instant::now();
        Self {
            id,
            wrapper,
            created_at: now,
            last_used: now,
            last_health_check: now,
            consecutive_failures: AtomicU8::new(0),
        }
    }

    fn should_recycle(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= 2
    }
}

#[derive(Debug)]
pub struct BrowserPool {
    config: BrowserPoolConfig,
    available: Arc<Mutex<VecDeque<PooledBrowser>>>,
    in_use_count: AtomicUsize,
    next_id: AtomicU64,
    scaler_handle: Mutex<Option<JoinHandle<()>>>,
    keepalive_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl BrowserPool {
    #[must_use]
    pub fn new(config: BrowserPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            available: Arc::new(Mutex::new(VecDeque::new())),
            in_use_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            scaler_handle: Mutex::new(None),
            keepalive_handle: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("starting browser pool: {:?}", self.config);
        self.scale_to_target().await?;

        let pool_clone = Arc::clone(self);
        let scaler = tokio::spawn(async move { scaler_loop(pool_clone).await });
        *self.scaler_handle.lock().await = Some(scaler);

        let pool_clone = Arc::clone(self);
        let keepalive = tokio::spawn(async move { keepalive_loop(pool_clone).await });
        *self.keepalive_handle.lock().await = Some(keepalive);

        info!(
            "browser pool started with {} pre-warmed browsers",
            self.available.lock().await.len()
        );
        Ok(())
    }

    /// Acquire a browser, bounded by `lease_deadline`. Returns
    /// `HarvestError::Exhausted` if no healthy browser becomes available in time,
    /// and `HarvestError::BrowserUnavailable` if launching a fresh browser fails.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledBrowserGuard, HarvestError> {
        let deadline = self.config.lease_deadline;
        match tokio::time::timeout(deadline, self.acquire_inner()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(HarvestError::Exhausted),
        }
    }

    async fn acquire_inner(self: &Arc<Self>) -> Result<PooledBrowserGuard, HarvestError> {
        loop {
            let mut available = self.available.lock().await;

            if let Some(mut browser) = available.pop_front() {
                match browser.wrapper.browser().version().await {
                    Ok(_) => {
                        browser.last_used = Instant::now();
                        browser.last_health_check = Instant::now();
                        browser.consecutive_failures.store(0, Ordering::Relaxed);
                        self.in_use_count.fetch_add(1, Ordering::Relaxed);
                        debug!("acquired browser {} from pool", browser.id);
                        return Ok(PooledBrowserGuard {
                            browser: Some(browser),
                            pool: Arc::clone(self),
                        });
                    }
                    Err(e) => {
                        let failures = browser.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            "browser {} failed health check during acquire ({failures} consecutive): {e}",
                            browser.id
                        );
                        drop(available);
                        if failures >= 2 {
                            close_and_drop(browser).await;
                        }
                        continue;
                    }
                }
            }

            drop(available);

            let total = self.in_use_count.load(Ordering::Relaxed) + self.available.lock().await.len();
            if total < self.config.max_pool_size {
                let browser = self
                    .launch_browser_internal()
                    .await
                    .map_err(|e| HarvestError::BrowserUnavailable(e.to_string()))?;
                self.in_use_count.fetch_add(1, Ordering::Relaxed);
                debug!("launched new browser {} for acquire (pool was empty)", browser.id);
                return Ok(PooledBrowserGuard {
                    browser: Some(browser),
                    pool: Arc::clone(self),
                });
            }

            warn!("browser pool at max capacity ({}), waiting...", self.config.max_pool_size);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn release(&self, browser: PooledBrowser) {
        self.in_use_count.fetch_sub(1, Ordering::Relaxed);

        if browser.should_recycle() {
            debug!("recycling browser {} after repeated failures", browser.id);
            tokio::spawn(close_and_drop(browser));
            return;
        }

        let mut browser = browser;
        browser.last_used = Instant::now();
        let available = Arc::clone(&self.available);
        let id = browser.id;
        tokio::spawn(async move {
            available.lock().await.push_back(browser);
            debug!("released browser {id} back to pool");
        });
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down browser pool");
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(handle) = self.scaler_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.keepalive_handle.lock().await.take() {
            handle.abort();
        }

        let mut available = self.available.lock().await;
        while let Some(browser) = available.pop_front() {
            close_and_drop(browser).await;
        }
        info!("browser pool shutdown complete");
        Ok(())
    }

    fn target_pool_size(&self) -> usize {
        let in_use = self.in_use_count.load(Ordering::Relaxed);
        (in_use + 2).max(self.config.min_pool_size).min(self.config.max_pool_size)
    }

    async fn scale_to_target(&self) -> Result<()> {
        let target = self.target_pool_size();
        let current = self.available.lock().await.len();
        if current >= target {
            return Ok(());
        }
        let to_launch = target - current;
        debug!("scaling pool: launching {to_launch} browsers (current={current}, target={target})");

        let futs: Vec<_> = (0..to_launch).map(|_| self.launch_browser_internal()).collect();
        let results = futures::future::join_all(futs).await;

        let mut available = self.available.lock().await;
        for result in results {
            match result {
                Ok(browser) => available.push_back(browser),
                Err(e) => warn!("failed to launch browser for pool: {e}"),
            }
        }
        Ok(())
    }

    async fn launch_browser_internal(&self) -> Result<PooledBrowser> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let user_data_dir = std::env::temp_dir().join(format!("job_harvester_pool_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&user_data_dir).context("failed to create pool browser profile dir")?;

        let (browser, mut handler) = Browser::launch(
            chromiumoxide::BrowserConfig::builder()
                .user_data_dir(&user_data_dir)
                .window_size(self.config.browser.viewport.0, self.config.browser.viewport.1)
                .build()
                .map_err(|e| anyhow::anyhow!(e))
                .context("failed to build browser config")?,
        )
        .await
        .context("failed to launch browser for pool")?;

        let handle = tokio::spawn(async move {
            use futures::StreamExt;
            while handler.next().await.is_some() {}
        });

        let wrapper = PooledBrowserWrapper::new(browser, handle, user_data_dir);
        Ok(PooledBrowser::new(id, wrapper))
    }
}

async fn close_and_drop(mut browser: PooledBrowser) {
    if let Some(b) = browser.wrapper.browser_mut() {
        if let Err(e) = b.close().await {
            warn!("failed to close browser {}: {e}", browser.id);
        }
        let _ = b.wait().await;
    } else {
        warn!("browser {} has outstanding references, skipping graceful close", browser.id);
    }
    browser.wrapper.cleanup_temp_dir();
}

/// RAII guard that returns the browser to the pool on drop.
pub struct PooledBrowserGuard {
    browser: Option<PooledBrowser>,
    pool: Arc<BrowserPool>,
}

impl PooledBrowserGuard {
    pub fn browser(&self) -> &Browser {
        self.browser.as_ref().expect("browser present").wrapper.browser()
    }

    pub fn browser_arc(&self) -> Arc<Browser> {
        self.browser.as_ref().expect("browser present").wrapper.browser_arc()
    }

    pub fn id(&self) -> u64 {
        self.browser.as_ref().expect("browser present").id
    }

    /// Called by the fetcher when a page leased from this browser misbehaves.
    /// Two consecutive reports recycle the browser instead of returning it to the
    /// pool (spec.md §4.2).
    pub fn record_failure(&self) {
        if let Some(b) = &self.browser {
            b.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_success(&self) {
        if let Some(b) = &self.browser {
            b.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }
}

impl Drop for PooledBrowserGuard {
    fn drop(&mut self) {
        if let Some(browser) = self.browser.take() {
            self.pool.release(browser);
        }
    }
}

async fn scaler_loop(pool: Arc<BrowserPool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    while !pool.shutdown.load(Ordering::Relaxed) {
        interval.tick().await;
        if let Err(e) = pool.scale_to_target().await {
            warn!("pool scaler error: {e}");
        }

        let mut available = pool.available.lock().await;
        let now = Instant::now();
        let min_size = pool.config.min_pool_size;
        while available.len() > min_size {
            match available.front() {
                Some(browser) if now.duration_since(browser.last_used) > pool.config.idle_timeout => {
                    if let Some(removed) = available.pop_front() {
                        debug!("removing idle browser {}", removed.id);
                        tokio::spawn(close_and_drop(removed));
                    }
                }
                _ => break,
            }
        }
    }
    debug!("scaler loop exiting");
}

async fn keepalive_loop(pool: Arc<BrowserPool>) {
    let mut interval = tokio::time::interval(pool.config.keepalive_interval);
    while !pool.shutdown.load(Ordering::Relaxed) {
        interval.tick().await;

        let mut available = pool.available.lock().await;
        let mut healthy = VecDeque::new();
        while let Some(browser) = available.pop_front() {
            match browser.wrapper.browser().version().await {
                Ok(_) => {
                    browser.last_health_check = Instant::now();
                    healthy.push_back(browser);
                }
                Err(e) => {
                    warn!("browser {} failed keepalive health check: {e}", browser.id);
                    tokio::spawn(close_and_drop(browser));
                }
            }
        }
        *available = healthy;
        debug!("keepalive complete: {} healthy browsers in pool", available.len());
    }
    debug!("keepalive loop exiting");
}
