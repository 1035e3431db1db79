//! # Structured Logging
//!
//! One-shot `tracing` initialization shared by the binary embedding this
//! crate and by integration tests. The filter comes from the `log.level`
//! configuration value, overridable through `RUST_LOG`.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber. Safe to call more than once;
/// only the first call takes effect (later callers, e.g. parallel tests,
/// reuse the existing subscriber).
pub fn init_logging(level: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let result = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        if result.is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}
