//! Closed error taxonomy for the collection engine.
//!
//! Components return `HarvestError` to the orchestrator, which is the only place
//! user-facing aggregation happens. Internal plumbing still carries `anyhow::Error`
//! at call boundaries that don't need the closed set (matching how the rest of this
//! workspace uses `anyhow` internally and a typed enum at public edges).

use std::fmt;

/// Categorizes page/fetch failures for retry decisions.
///
/// `ContentExtraction` (selector-not-found on a page that did load) is not retried;
/// everything else is, with a per-kind backoff multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Browser,
    ContentExtraction,
    RateLimited,
    AntiBot,
    Unknown,
}

impl FailureKind {
    /// Classify an error into a failure kind based on message patterns.
    #[must_use]
    pub fn classify(error: &anyhow::Error) -> Self {
        let msg = error.to_string().to_lowercase();

        if msg.contains("captcha") || msg.contains("anti-bot") || msg.contains("challenge") {
            return Self::AntiBot;
        }
        if msg.contains("429") || msg.contains("too many requests") || msg.contains("rate limit") {
            return Self::RateLimited;
        }
        if msg.contains("timeout")
            || msg.contains("timed out")
            || msg.contains("connection refused")
            || msg.contains("connection reset")
            || msg.contains("dns")
            || msg.contains("network")
            || msg.contains("unreachable")
            || msg.contains("eof")
        {
            return Self::Network;
        }
        if msg.contains("browser")
            || msg.contains("page")
            || msg.contains("chrome")
            || msg.contains("cdp")
            || msg.contains("target")
            || msg.contains("session")
        {
            return Self::Browser;
        }
        if msg.contains("extract")
            || msg.contains("selector")
            || msg.contains("parse")
            || msg.contains("html")
        {
            return Self::ContentExtraction;
        }
        Self::Unknown
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network | Self::Browser | Self::RateLimited | Self::Unknown => true,
            Self::ContentExtraction | Self::AntiBot => false,
        }
    }

    #[must_use]
    pub const fn delay_multiplier(&self) -> f64 {
        match self {
            Self::Network => 1.0,
            Self::Browser => 1.5,
            Self::RateLimited => 3.0,
            Self::ContentExtraction | Self::Unknown | Self::AntiBot => 1.0,
        }
    }
}

/// Closed error set surfaced by components to the orchestrator.
#[derive(Debug, Clone)]
pub enum HarvestError {
    /// Invalid configuration; fails before any I/O.
    Config(String),
    /// Headless engine binaries missing or unreachable; fatal for the whole run.
    BrowserUnavailable(String),
    /// Timeouts, resets; retried per the fetcher's backoff policy.
    NetworkTransient(String),
    /// Browser pool could not drain a lease within `leaseDeadline`.
    Exhausted,
    /// Detected challenge wall; fatal for that URL within the session, non-fatal overall.
    AntiBot { url: String },
    /// Extraction produced no records on a page that did load.
    Parse(String),
    /// Cache index checksum mismatch at startup; auto-recovered by rebuild.
    CacheCorruption(String),
    /// Checkpoint JSON unreadable; treated as empty checkpoint for that URL.
    CheckpointCorruption(String),
    /// Cooperative shutdown; propagates as-is.
    Cancelled,
}

impl fmt::Display for HarvestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::BrowserUnavailable(msg) => write!(f, "browser unavailable: {msg}"),
            Self::NetworkTransient(msg) => write!(f, "network error: {msg}"),
            Self::Exhausted => write!(f, "browser pool exhausted before lease deadline"),
            Self::AntiBot { url } => write!(f, "anti-bot challenge detected at {url}"),
            Self::Parse(msg) => write!(f, "extraction error: {msg}"),
            Self::CacheCorruption(msg) => write!(f, "cache corruption: {msg}"),
            Self::CheckpointCorruption(msg) => write!(f, "checkpoint corruption: {msg}"),
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for HarvestError {}

impl From<anyhow::Error> for HarvestError {
    fn from(err: anyhow::Error) -> Self {
        Self::NetworkTransient(format!("{err:#}"))
    }
}

/// Convenience alias for `Result` with `HarvestError`.
pub type HarvestResult<T> = Result<T, HarvestError>;

/// One non-fatal error attached to a `SessionResult`, scoped to a single URL/page.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UrlError {
    pub url: String,
    pub page_no: u32,
    pub message: String,
}
