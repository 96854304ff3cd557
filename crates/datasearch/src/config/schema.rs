use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::enrichment::{EnrichmentStage, RetryMode, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Defaults to `~/.datasearch/data/datasearch.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Stage invocations allowed per record before it fails for good.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_stages")]
    pub stages: Vec<EnrichmentStage>,
    #[serde(default)]
    pub on_failure: RetryMode,
    #[serde(default)]
    pub on_rate_limit: RetryMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    6
}

fn default_stages() -> Vec<EnrichmentStage> {
    EnrichmentStage::ALL.to_vec()
}

fn default_batch_size() -> u32 {
    100
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stale_claim_secs() -> u64 {
    3600
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            stages: default_stages(),
            on_failure: RetryMode::default(),
            on_rate_limit: RetryMode::default(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            stale_claim_secs: default_stale_claim_secs(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl EnrichmentConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            on_failure: self.on_failure,
            on_rate_limit: self.on_rate_limit,
        }
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn busy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        i64::try_from(self.stale_claim_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
