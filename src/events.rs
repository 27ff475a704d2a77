//! Typed event stream exposed by the orchestrator.
//!
//! The core "never writes to the terminal" (spec §4.9 step 7); instead it publishes
//! a typed event onto a broadcast channel that a CLI or other collaborator can
//! subscribe to. Grounded on the teacher's `crawl_events` bus, trimmed to a single
//! module and to the event variants this engine actually emits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One observable occurrence during a harvest session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HarvestEvent {
    SessionStarted {
        urls: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    UrlStarted {
        url: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    PageFetched {
        url: String,
        page_no: u32,
        records: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    EndOfPagination {
        url: String,
        page_no: u32,
        reason: &'static str,
    },
    AntiBotDetected {
        url: String,
    },
    RetryExhausted {
        url: String,
        page_no: u32,
        error: String,
    },
    CheckpointCommitted {
        url: String,
        new: usize,
        updated: usize,
        duplicate: usize,
    },
    SessionCompleted {
        total_pages: usize,
        new: usize,
        updated: usize,
        duplicate: usize,
        duration: std::time::Duration,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    Cancelled,
}

/// Lock-free counters mirrored from the teacher's `EventBusMetrics`.
#[derive(Debug, Clone, Default)]
pub struct EventBusMetrics {
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    active_subscribers: Arc<AtomicUsize>,
}

impl EventBusMetrics {
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            active_subscribers: self.active_subscribers.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub dropped: u64,
    pub active_subscribers: usize,
}

/// Broadcast-backed event bus; `publish` never blocks and is best-effort when there
/// are no subscribers (mirrors the teacher's bus semantics).
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HarvestEvent>,
    metrics: EventBusMetrics,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            metrics: EventBusMetrics::default(),
        }
    }

    pub fn publish(&self, event: HarvestEvent) {
        match self.sender.send(event) {
            Ok(n) => {
                self.metrics.published.fetch_add(1, Ordering::SeqCst);
                self.metrics.active_subscribers.store(n, Ordering::SeqCst);
            }
            Err(_) => {
                self.metrics.dropped.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn metrics(&self) -> &EventBusMetrics {
        &self.metrics
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
