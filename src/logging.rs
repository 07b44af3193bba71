//! Logging bootstrap
//!
//! Thin helper over `tracing-subscriber` for binaries and tests that
//! embed the crate. The library itself only emits `tracing` events.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("logging initialization failed: {0}")]
    InitializationFailed(String),
}

/// Initialize logging honoring `RUST_LOG`, defaulting to `info`
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_filter("info")
}

/// Initialize logging with an explicit default filter directive
pub fn init_logging_with_filter(default_filter: &str) -> Result<(), LoggingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_init_reports_error_instead_of_panicking() {
        // A global subscriber can only be installed once per process, so
        // the second call always errors, whoever won the first slot
        let _ = init_logging();
        assert!(init_logging().is_err());
    }
}
