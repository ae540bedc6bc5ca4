//! Engine configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML/YAML/JSON file,
//! then `REMEDIATION__*` environment variables (e.g.
//! `REMEDIATION__SCHEDULER__WORKER_COUNT=40`). Binaries call `dotenv()` first so
//! a local `.env` file feeds the environment layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{RemediationError, Result};

/// Top-level configuration for the engine and admin binaries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub vault: VaultConfig,
    /// Fallback tracing filter when `RUST_LOG` is unset
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/remediation".to_string(),
            max_connections: 10,
        }
    }
}

/// Scheduler cadence and worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// Used when a poller has no positive polling interval
    pub default_poll_interval_secs: u64,
    pub retention_interval_secs: u64,
    /// Integrations whose name contains this marker (case-insensitive) are pollers
    pub poller_marker: String,
    /// Run poll tasks inline on the tick instead of the worker pool
    pub synchronous: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            queue_capacity: 1000,
            worker_count: 20,
            default_poll_interval_secs: 60,
            retention_interval_secs: 24 * 60 * 60,
            poller_marker: "Detector".to_string(),
            synchronous: false,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs.max(1))
    }
}

/// Retry, circuit breaker and transport settings for the action executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub http_timeout_secs: u64,
    /// Retries used when an action definition has a non-positive retry count
    pub default_retry_count: u32,
    pub backoff_base_ms: u64,
    pub circuit_trip_threshold: i32,
    /// Log redacted rendered payloads at debug level
    pub debug_payloads: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 15,
            default_retry_count: 3,
            backoff_base_ms: 1000,
            circuit_trip_threshold: 5,
            debug_payloads: false,
        }
    }
}

impl ExecutorConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    /// Base64-encoded 32-byte AES key. Without it credentials are stored in plaintext.
    pub key_base64: Option<String>,
}

impl EngineConfig {
    /// Load configuration from an optional file and the `REMEDIATION` environment prefix.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::with_name(path)),
            None => builder.add_source(config::File::with_name("remediation").required(false)),
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix("REMEDIATION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RemediationError::Configuration(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| RemediationError::Configuration(e.to_string()))
    }
}
