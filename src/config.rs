//! Bridge configuration
//!
//! Loaded from a JSON file, from `WEBDB_*` environment variables (with `.env`
//! support), or left at its defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::RetryPolicy;

/// Upstream teardown retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    /// Attempts including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Upper bound for one release attempt
    pub attempt_timeout_ms: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 1_000,
            attempt_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub teardown: TeardownConfig,

    /// Per-request timeout on the WebSocket transport
    pub request_timeout_ms: u64,

    /// How often the adapter checks the transport for a reconnect
    pub connection_poll_ms: u64,

    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            teardown: TeardownConfig::default(),
            request_timeout_ms: 10_000,
            connection_poll_ms: 250,
            reconnect_initial_delay_ms: 100,
            reconnect_max_delay_ms: 5_000,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file; missing fields keep their defaults
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        if let Some(attempts) = env_number("WEBDB_TEARDOWN_ATTEMPTS")? {
            config.teardown.max_attempts = attempts;
        }
        if let Some(ms) = env_number("WEBDB_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = ms;
        }
        if let Some(ms) = env_number("WEBDB_CONNECTION_POLL_MS")? {
            config.connection_poll_ms = ms;
        }
        if let Some(ms) = env_number("WEBDB_RECONNECT_MAX_DELAY_MS")? {
            config.reconnect_max_delay_ms = ms;
        }
        Ok(config)
    }

    pub fn teardown_policy(&self) -> RetryPolicy {
        let teardown = &self.teardown;
        RetryPolicy {
            max_attempts: teardown.max_attempts.max(1),
            initial_delay: Duration::from_millis(teardown.initial_delay_ms),
            backoff_multiplier: teardown.backoff_multiplier,
            max_delay: Duration::from_millis(teardown.max_delay_ms),
            attempt_timeout: match teardown.attempt_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connection_poll(&self) -> Duration {
        Duration::from_millis(self.connection_poll_ms.max(1))
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

fn env_number<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} must be a number, got {raw:?}")),
        Err(_) => Ok(None),
    }
}
