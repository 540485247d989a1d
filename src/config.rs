//! Recognized configuration surface (spec §6).
//!
//! The engine is embedded; it doesn't own a config *file* format the way a
//! standalone service would, but it still exposes the same load-from-env /
//! load-from-file shape the rest of the ecosystem uses, scoped to the
//! options this crate actually reads.

use crate::constants::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `timeouts.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_flow_timeout_secs")]
    pub flow_execution_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_secs: u64,
}

fn default_flow_timeout_secs() -> u64 {
    DEFAULT_FLOW_TIMEOUT_SECS
}
fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            flow_execution_secs: DEFAULT_FLOW_TIMEOUT_SECS,
            http_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl TimeoutsConfig {
    pub fn flow_execution(&self) -> Duration {
        Duration::from_secs(self.flow_execution_secs)
    }

    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http_secs)
    }
}

/// `cache.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// `retry.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub default_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}
fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            default_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl RetryConfig {
    pub fn default_delay(&self) -> Duration {
        Duration::from_millis(self.default_delay_ms)
    }
}

/// `logging.*` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether sensitive-key redaction applies to context dumps in logs.
    #[serde(default = "default_true")]
    pub sanitize: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            sanitize: true,
        }
    }
}

/// The engine's complete configuration snapshot, handed to every
/// `ExecutionContext` at creation time (spec §3's "configuration snapshot").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a JSON file, falling back to defaults if the
    /// file does not exist.
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::EngineError::configuration(format!("reading config: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| crate::EngineError::configuration(format!("parsing config: {e}")))
    }

    /// Initialize logging for the host process, matching the level configured
    /// under `logging.level`.
    pub fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let default_filter = format!("bff_orchestrator={}", self.logging.level);
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
