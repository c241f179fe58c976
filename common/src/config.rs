//! Service configuration.
//!
//! Values come from environment variables; anything unset or unparsable
//! falls back to its default.

use std::str::FromStr;
use std::time::Duration;

/// Default table the background loaders publish connection state into.
pub const DEFAULT_STATE_TABLE: &str = "internal.connection_state";

/// Schema holding loader bookkeeping, always appended to the search path.
pub const INTERNAL_SCHEMA: &str = "internal";

/// Retry policy for queries that hit a not-yet-loaded schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Ceiling on total wall-clock time across all attempts.
    pub max_duration: Duration,
    /// Fixed spacing between attempts. Also the threshold a `ready` state
    /// must have been stable for before it is trusted.
    pub backoff_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(10 * 60),
            backoff_interval: Duration::from_millis(250),
        }
    }
}

impl RetryConfig {
    /// Builds a retry policy from explicit values.
    pub fn new(max_duration: Duration, backoff_interval: Duration) -> Self {
        Self {
            max_duration,
            backoff_interval,
        }
    }

    /// Loads the retry policy from `QUERY_RETRY_MAX_DURATION_SECS` and
    /// `QUERY_RETRY_BACKOFF_MS`.
    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            max_duration: env_or("QUERY_RETRY_MAX_DURATION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_duration),
            backoff_interval: env_or("QUERY_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_interval),
        }
    }
}

/// Where connection state lives and how long callers may block on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateConfig {
    /// Fully qualified name of the connection state table.
    pub table: String,
    /// Delay between polls while waiting for a state condition.
    pub poll_interval: Duration,
    /// Upper bound for a single blocking wait.
    pub wait_timeout: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_STATE_TABLE.to_string(),
            poll_interval: Duration::from_millis(250),
            wait_timeout: Duration::from_secs(30),
        }
    }
}

impl StateConfig {
    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            table: std::env::var("CONNECTION_STATE_TABLE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.table),
            poll_interval: env_or("CONNECTION_STATE_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            wait_timeout: env_or("CONNECTION_STATE_WAIT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.wait_timeout),
        }
    }
}

/// Search path settings applied to every session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPathConfig {
    /// Explicit search path. When empty the path is derived from the
    /// connections currently known to the loaders.
    pub search_path: Vec<String>,
    /// Schemas placed in front of the search path.
    pub search_path_prefix: Vec<String>,
}

impl SearchPathConfig {
    pub fn load() -> Self {
        Self {
            search_path: env_list("SEARCH_PATH"),
            search_path_prefix: env_list("SEARCH_PATH_PREFIX"),
        }
    }
}

/// Application configuration shared by the services.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Service name used in logs and response metadata.
    pub service_name: String,
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Backend connection string.
    pub database_url: String,
    /// Maximum pooled backend connections.
    pub max_connections: u32,
    /// Timeout for acquiring a backend connection, in seconds.
    pub connect_timeout_secs: u64,
    pub retry: RetryConfig,
    pub state: StateConfig,
    pub search_path: SearchPathConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "query-service".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8082,
            database_url: "postgres://postgres@localhost:5432/postgres".to_string(),
            max_connections: 10,
            connect_timeout_secs: 10,
            retry: RetryConfig::default(),
            state: StateConfig::default(),
            search_path: SearchPathConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from the environment for the named service.
    pub fn load_with_service(service_name: &str) -> Self {
        let defaults = Self::default();
        let config = Self {
            service_name: service_name.to_string(),
            host: std::env::var("SERVER_HOST").unwrap_or(defaults.host),
            port: env_or("SERVER_PORT").unwrap_or(defaults.port),
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_or("DB_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connect_timeout_secs),
            retry: RetryConfig::load(),
            state: StateConfig::load(),
            search_path: SearchPathConfig::load(),
        };

        tracing::debug!(
            service = %config.service_name,
            max_retry_secs = config.retry.max_duration.as_secs(),
            backoff_ms = config.retry.backoff_interval.as_millis() as u64,
            state_table = %config.state.table,
            "Configuration loaded"
        );
        config
    }
}

fn env_or<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| split_list(&v))
        .unwrap_or_default()
}

/// Splits a comma separated list, dropping blank entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
