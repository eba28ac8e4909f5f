//! Logging subsystem
//!
//! Structured logging via tracing: JSON output in production, plaintext
//! in development. The filter comes from `PINCER_LOG`, then `RUST_LOG`,
//! then the configured default level.

use std::io;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON for production.
    Json,
    /// Human-readable plaintext for development.
    #[default]
    Plaintext,
}

/// Configuration for the logging subsystem.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub default_level: Level,
}

impl LogConfig {
    pub fn development() -> Self {
        LogConfig {
            format: LogFormat::Plaintext,
            default_level: Level::DEBUG,
        }
    }

    pub fn production() -> Self {
        LogConfig {
            format: LogFormat::Json,
            default_level: Level::INFO,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the filter from `PINCER_LOG`, then `RUST_LOG`, then the default.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var("PINCER_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    Ok(EnvFilter::try_new(
        default_level.as_str().to_lowercase(),
    )?)
}

/// Initialize the logging subsystem. Call once at startup.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(config.default_level)?;
    let timer = UtcTime::rfc_3339();

    match config.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_writer(io::stdout)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_writer(io::stdout)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
    }
    Ok(())
}

/// Initialize logging for tests. Safe to call from multiple tests;
/// repeated initialization is silently ignored.
pub fn init_test_logging() {
    if INIT_GUARD.set(()).is_err() {
        return;
    }
    let filter = match build_env_filter(Level::DEBUG) {
        Ok(filter) => filter,
        Err(_) => return,
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(io::stdout)
        .with_filter(filter);
    let _ = tracing_subscriber::registry().with(layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that modify process environment variables.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn log_config_profiles() {
        let dev = LogConfig::development();
        assert_eq!(dev.format, LogFormat::Plaintext);
        assert_eq!(dev.default_level, Level::DEBUG);

        let prod = LogConfig::production();
        assert_eq!(prod.format, LogFormat::Json);
        assert_eq!(prod.default_level, Level::INFO);
    }

    #[test]
    fn env_filter_default() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::remove_var("PINCER_LOG");
        std::env::remove_var("RUST_LOG");
        assert!(build_env_filter(Level::INFO).is_ok());
    }

    #[test]
    fn env_filter_pincer_log_takes_precedence() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("PINCER_LOG", "pincer=debug,warn");
        std::env::set_var("RUST_LOG", "error");
        assert!(build_env_filter(Level::INFO).is_ok());
        std::env::remove_var("PINCER_LOG");
        std::env::remove_var("RUST_LOG");
    }
}
