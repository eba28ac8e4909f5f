//! Configuration
//!
//! Typed service configuration with defaults in code, an optional JSON
//! config file, and `PINCER_*` environment overrides (highest
//! precedence). Timeouts are written in seconds in the file and the
//! environment; tests that need sub-second values construct [`Config`]
//! directly.

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
/// Default in-process message bus endpoint.
pub const DEFAULT_BUS_URI: &str = "mem://local";
/// Default in-process store endpoint.
pub const DEFAULT_STORE_URI: &str = "mem://local";
/// Default keep-alive ping interval.
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(30);
/// Default pong deadline after a ping.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);
/// Default bound on a single socket write.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
/// Default outbound channel capacity per connection.
pub const DEFAULT_SEND_BUFFER: usize = 32;
/// Default budget for graceful shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address.
    pub listen_addr: String,
    /// Message bus endpoint. Only the `mem://` scheme is recognized.
    pub bus_uri: String,
    /// Store endpoint. Only the `mem://` scheme is recognized.
    pub store_uri: String,
    /// Log at debug level in development format.
    pub debug_log: bool,
    /// Keep-alive ping interval.
    pub ping_period: Duration,
    /// Deadline for a pong after a ping.
    pub pong_wait: Duration,
    /// Bound on a single socket write.
    pub write_wait: Duration,
    /// Outbound channel capacity per connection.
    pub send_buffer: usize,
    /// How long shutdown waits for connections to drain.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            bus_uri: DEFAULT_BUS_URI.to_string(),
            store_uri: DEFAULT_STORE_URI.to_string(),
            debug_log: false,
            ping_period: DEFAULT_PING_PERIOD,
            pong_wait: DEFAULT_PONG_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
            send_buffer: DEFAULT_SEND_BUFFER,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// On-disk representation: every field optional, timeouts in seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,
    bus_uri: Option<String>,
    store_uri: Option<String>,
    debug_log: Option<bool>,
    ping_period: Option<u64>,
    pong_wait: Option<u64>,
    write_wait: Option<u64>,
    send_buffer: Option<usize>,
    shutdown_grace: Option<u64>,
}

impl Config {
    /// Load configuration: defaults, then the optional file, then
    /// `PINCER_*` environment overrides. Validates before returning.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        if let Some(path) = path {
            config.apply_file(path)?;
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let file: FileConfig = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        if let Some(v) = file.listen_addr {
            self.listen_addr = v;
        }
        if let Some(v) = file.bus_uri {
            self.bus_uri = v;
        }
        if let Some(v) = file.store_uri {
            self.store_uri = v;
        }
        if let Some(v) = file.debug_log {
            self.debug_log = v;
        }
        if let Some(v) = file.ping_period {
            self.ping_period = Duration::from_secs(v);
        }
        if let Some(v) = file.pong_wait {
            self.pong_wait = Duration::from_secs(v);
        }
        if let Some(v) = file.write_wait {
            self.write_wait = Duration::from_secs(v);
        }
        if let Some(v) = file.send_buffer {
            self.send_buffer = v;
        }
        if let Some(v) = file.shutdown_grace {
            self.shutdown_grace = Duration::from_secs(v);
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = env::var("PINCER_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = env::var("PINCER_BUS_URI") {
            self.bus_uri = v;
        }
        if let Ok(v) = env::var("PINCER_STORE_URI") {
            self.store_uri = v;
        }
        if let Ok(v) = env::var("PINCER_DEBUG_LOG") {
            self.debug_log = parse_bool("PINCER_DEBUG_LOG", &v)?;
        }
        if let Ok(v) = env::var("PINCER_PING_PERIOD") {
            self.ping_period = parse_secs("PINCER_PING_PERIOD", &v)?;
        }
        if let Ok(v) = env::var("PINCER_PONG_WAIT") {
            self.pong_wait = parse_secs("PINCER_PONG_WAIT", &v)?;
        }
        if let Ok(v) = env::var("PINCER_WRITE_WAIT") {
            self.write_wait = parse_secs("PINCER_WRITE_WAIT", &v)?;
        }
        if let Ok(v) = env::var("PINCER_SEND_BUFFER") {
            self.send_buffer = v.parse().map_err(|_| ConfigError::Invalid {
                key: "PINCER_SEND_BUFFER",
                message: format!("{v:?} is not a valid buffer size"),
            })?;
        }
        if let Ok(v) = env::var("PINCER_SHUTDOWN_GRACE") {
            self.shutdown_grace = parse_secs("PINCER_SHUTDOWN_GRACE", &v)?;
        }
        Ok(())
    }

    /// Check invariants that would otherwise surface as confusing
    /// runtime behavior.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                key: "listen_addr",
                message: format!("{:?}: {e}", self.listen_addr),
            })?;
        for (key, uri) in [("bus_uri", &self.bus_uri), ("store_uri", &self.store_uri)] {
            if uri_scheme(uri) != Some("mem") {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("unsupported scheme in {uri:?} (expected mem://)"),
                });
            }
        }
        if self.ping_period.is_zero() || self.pong_wait <= self.ping_period {
            return Err(ConfigError::Invalid {
                key: "pong_wait",
                message: "pong_wait must exceed a non-zero ping_period".to_string(),
            });
        }
        if self.write_wait.is_zero() {
            return Err(ConfigError::Invalid {
                key: "write_wait",
                message: "write_wait must be non-zero".to_string(),
            });
        }
        if self.send_buffer == 0 {
            return Err(ConfigError::Invalid {
                key: "send_buffer",
                message: "send_buffer must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Scheme of a URI-ish string, e.g. `mem` for `mem://local`.
pub fn uri_scheme(uri: &str) -> Option<&str> {
    uri.split_once("://").map(|(scheme, _)| scheme)
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            message: format!("{raw:?} is not a boolean"),
        }),
    }
}

fn parse_secs(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::Invalid {
            key,
            message: format!("{raw:?} is not a number of seconds"),
        })
}
