//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::dispatch::retry::RetryPolicy;
use crate::error::ConfigError;

/// Dispatch worker pool configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum items claimed per shard round trip.
    pub batch_size: usize,
    /// Maximum sends in flight at once for a single device.
    pub per_device_concurrency: usize,
    /// How often the supervisor looks for devices with pending work.
    pub poll_interval: Duration,
    /// Hard limit for a single outbound send call.
    pub send_timeout: Duration,
    /// Backoff and attempt budget for transient failures.
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            per_device_concurrency: 4,
            poll_interval: Duration::from_secs(2),
            send_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    /// Build config from `COURIER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry_defaults = RetryPolicy::default();

        let retry = RetryPolicy {
            max_attempts: env_parse("COURIER_RETRY_MAX_ATTEMPTS").unwrap_or(retry_defaults.max_attempts),
            base_delay: env_parse("COURIER_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.base_delay),
            max_delay: env_parse("COURIER_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.max_delay),
            factor: env_parse("COURIER_RETRY_FACTOR").unwrap_or(retry_defaults.factor),
            jitter: env_parse("COURIER_RETRY_JITTER").unwrap_or(retry_defaults.jitter),
        };

        Self {
            batch_size: env_parse::<usize>("COURIER_BATCH_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            per_device_concurrency: env_parse::<usize>("COURIER_DEVICE_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.per_device_concurrency),
            poll_interval: env_parse("COURIER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            send_timeout: env_parse("COURIER_SEND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.send_timeout),
            retry,
        }
    }
}

/// Process-level settings for the `courier` binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SQLite/libSQL database file.
    pub db_path: PathBuf,
    /// HTTP + WebSocket listen port.
    pub port: u16,
    /// Capacity of the event fan-out ring buffer.
    pub event_capacity: usize,
    /// Base URL of the device gateway that owns the device sessions.
    pub gateway_url: String,
    /// Bearer token for the gateway, if it requires one.
    pub gateway_token: Option<SecretString>,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/courier.db"),
            port: 8080,
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
            gateway_url: "http://127.0.0.1:3000".to_string(),
            gateway_token: None,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Build config from `COURIER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            db_path: std::env::var("COURIER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port: env_parse("COURIER_PORT").unwrap_or(defaults.port),
            event_capacity: env_parse::<usize>("COURIER_EVENT_CAPACITY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.event_capacity),
            gateway_url: std::env::var("COURIER_GATEWAY_URL").unwrap_or(defaults.gateway_url),
            gateway_token: std::env::var("COURIER_GATEWAY_TOKEN")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            log_dir: std::env::var("COURIER_LOG_DIR").ok().map(PathBuf::from),
        }
    }

    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.gateway_url.starts_with("http://") || self.gateway_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "COURIER_GATEWAY_URL".into(),
                message: format!("expected an http(s) URL, got {:?}", self.gateway_url),
            });
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "COURIER_DB_PATH".into(),
                message: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Read and parse an environment variable, ignoring missing or malformed values.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable config value");
            None
        }
    }
}
