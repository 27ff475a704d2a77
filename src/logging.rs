//! Logging bootstrap. The teacher depends on `log`+`env_logger` and
//! `tracing`+`tracing-subscriber` simultaneously (see its `Cargo.toml`); this crate
//! follows that rather than picking one, since most ported modules already call
//! `log::{debug,info,warn}` directly while the orchestrator's top-level run is wrapped
//! in a `tracing::info_span!`. Both read their verbosity from `RUST_LOG`.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes both logging facades. Safe to call more than once (e.g. from test
/// setup) — only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::try_init();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
