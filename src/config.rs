//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Storage backend selector
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SQLite database shared by every worker process
    #[default]
    Sqlite,
    /// Single-process, in-memory storage
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Memory => "memory",
        }
    }
}

/// Queue behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Storage backend
    #[serde(default)]
    pub backend: BackendKind,
    /// Fallback poll interval in milliseconds (default: 5000)
    pub poll_interval_ms: u64,
    /// Ordering lock lease in seconds (default: 60)
    pub lock_lease_seconds: u64,
    /// Worker identity; random when unset
    pub worker_id: Option<String>,
    /// Keep claimed envelopes reserved and let the backend redeliver
    /// failures (memory backend only)
    #[serde(default)]
    pub native_retry: bool,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_seconds)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
    /// Connection pool size (default: 8)
    pub max_connections: u32,
    /// How long a writer waits for the database lock (default: 5000)
    pub busy_timeout_ms: u64,
    /// Prefix for queue-owned tables (default: "resort_queue")
    pub table_prefix: String,
}

/// Outbound federation settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// User-Agent header for inbox deliveries
    pub user_agent: String,
    /// Per-request timeout in seconds (default: 30)
    pub request_timeout_seconds: u64,
    pub retry: RetryConfig,
}

/// Backoff settings for failed deliveries
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
    #[serde(default = "default_retry_jitter")]
    pub jitter: bool,
}

fn default_retry_jitter() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (RESORT_QUEUE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::QueueError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("queue.backend", "sqlite")?
            .set_default("queue.poll_interval_ms", 5000)?
            .set_default("queue.lock_lease_seconds", 60)?
            .set_default("queue.native_retry", false)?
            .set_default("database.path", "data/queue.db")?
            .set_default("database.max_connections", 8)?
            .set_default("database.busy_timeout_ms", 5000)?
            .set_default("database.table_prefix", "resort_queue")?
            .set_default("federation.user_agent", "RustResort/0.1.0")?
            .set_default("federation.request_timeout_seconds", 30)?
            .set_default("federation.retry.initial_delay_ms", 1000)?
            .set_default("federation.retry.max_delay_ms", 43_200_000)?
            .set_default("federation.retry.multiplier", 2.0)?
            .set_default("federation.retry.max_attempts", 10)?
            .set_default("federation.retry.jitter", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("RESORT_QUEUE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::QueueError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::QueueError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::QueueError> {
        use crate::error::QueueError;

        if self.queue.poll_interval_ms == 0 {
            return Err(QueueError::Config(
                "queue.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.queue.lock_lease_seconds == 0 {
            return Err(QueueError::Config(
                "queue.lock_lease_seconds must be greater than 0".to_string(),
            ));
        }

        if self.queue.native_retry && self.queue.backend != BackendKind::Memory {
            return Err(QueueError::Config(
                "queue.native_retry is only supported by the memory backend".to_string(),
            ));
        }

        if !is_sql_identifier(&self.database.table_prefix) {
            return Err(QueueError::Config(format!(
                "database.table_prefix must be an SQL identifier, got {:?}",
                self.database.table_prefix
            )));
        }

        if self.database.max_connections == 0 {
            return Err(QueueError::Config(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        if self.database.max_connections < 2 && self.queue.backend == BackendKind::Sqlite {
            tracing::warn!(
                max_connections = self.database.max_connections,
                "A single connection is pinned while an ordering lease is held; \
                 handlers that enqueue will wait for the lease to be released"
            );
        }

        if self.federation.retry.multiplier < 1.0 {
            return Err(QueueError::Config(
                "federation.retry.multiplier must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub(crate) fn is_sql_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
