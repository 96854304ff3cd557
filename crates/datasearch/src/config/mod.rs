pub mod loader;
pub mod schema;

use std::path::PathBuf;

pub use loader::{load_config, load_config_from_str, load_config_with_env};
pub use schema::{Config, EnrichmentConfig, LoggingConfig};

use crate::db::default_database_path;
use crate::enrichment::StagePlan;
use crate::error::ConfigError;
use crate::worker::PoolSettings;

impl Config {
    /// The configured database path, or the per-user default.
    pub fn resolved_database_path(&self) -> Result<PathBuf, ConfigError> {
        self.database_path
            .clone()
            .or_else(default_database_path)
            .ok_or_else(|| ConfigError::Validation {
                message: "No database_path configured and no home directory found".to_string(),
            })
    }

    pub fn stage_plan(&self) -> Result<StagePlan, ConfigError> {
        StagePlan::new(self.enrichment.stages.clone()).map_err(|e| ConfigError::Validation {
            message: e.to_string(),
        })
    }

    /// Worker pool settings for this config.
    pub fn pool_settings(&self, worker_prefix: &str) -> Result<PoolSettings, ConfigError> {
        Ok(PoolSettings {
            worker_count: self.worker_count,
            sources: self.sources.clone(),
            plan: self.stage_plan()?,
            policy: self.enrichment.retry_policy(),
            batch_size: self.enrichment.batch_size,
            poll_interval: self.enrichment.poll_interval(),
            stale_after: self.enrichment.stale_after(),
            worker_prefix: worker_prefix.to_string(),
        })
    }
}
