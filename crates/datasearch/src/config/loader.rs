use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub const ENV_DATABASE_PATH: &str = "DATASEARCH_DATABASE_PATH";
pub const ENV_LOG_LEVEL: &str = "DATASEARCH_LOG_LEVEL";
pub const ENV_WORKER_COUNT: &str = "DATASEARCH_WORKER_COUNT";

/// Longest accepted stale-claim timeout: one year.
const MAX_STALE_CLAIM_SECS: u64 = 365 * 24 * 60 * 60;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Parses, applies `DATASEARCH_*` environment overrides and validates.
pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    load_config_with_env(content, |name| std::env::var(name).ok())
}

/// Like [`load_config_from_str`] with an explicit environment lookup.
pub fn load_config_with_env<F>(content: &str, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let mut config: Config = serde_json::from_value(json_value)?;

    apply_env_overrides(&mut config, env)?;
    validate_config(&config)?;

    Ok(config)
}

fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = env(ENV_DATABASE_PATH).filter(|v| !v.is_empty()) {
        config.database_path = Some(PathBuf::from(path));
    }
    if let Some(level) = env(ENV_LOG_LEVEL).filter(|v| !v.is_empty()) {
        config.logging.level = level;
    }
    if let Some(count) = env(ENV_WORKER_COUNT).filter(|v| !v.is_empty()) {
        config.worker_count = count.parse().map_err(|_| ConfigError::InvalidEnv {
            name: ENV_WORKER_COUNT,
            value: count.clone(),
        })?;
    }
    Ok(())
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

pub(crate) fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.worker_count == 0 {
        return Err(invalid("worker_count must be at least 1"));
    }

    let mut sources = HashSet::new();
    for source in &config.sources {
        if source.is_empty() || source.len() > 50 {
            return Err(invalid(format!(
                "Source name '{}' must be 1 to 50 characters",
                source
            )));
        }
        if !sources.insert(source) {
            return Err(invalid(format!("Duplicate source '{}'", source)));
        }
    }

    let enrichment = &config.enrichment;
    if enrichment.stages.is_empty() {
        return Err(invalid("enrichment.stages must not be empty"));
    }
    let mut stages = HashSet::new();
    for stage in &enrichment.stages {
        if !stages.insert(stage) {
            return Err(invalid(format!("Duplicate stage '{}'", stage)));
        }
    }

    // Every stage invocation spends an attempt, so a clean run needs one
    // attempt per stage.
    if (enrichment.max_attempts as usize) < enrichment.stages.len() {
        return Err(invalid(format!(
            "enrichment.max_attempts ({}) must be at least the number of stages ({})",
            enrichment.max_attempts,
            enrichment.stages.len()
        )));
    }

    if enrichment.batch_size == 0 {
        return Err(invalid("enrichment.batch_size must be at least 1"));
    }
    if enrichment.stale_claim_secs == 0 || enrichment.stale_claim_secs > MAX_STALE_CLAIM_SECS {
        return Err(invalid(format!(
            "enrichment.stale_claim_secs must be between 1 and {}",
            MAX_STALE_CLAIM_SECS
        )));
    }

    if config.logging.level.trim().is_empty() {
        return Err(invalid("logging.level must not be empty"));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}
