use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataSearchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Enrichment error: {0}")]
    Enrichment(#[from] crate::enrichment::EnrichmentError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid environment override {name}='{value}'")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker '{worker_id}': {source}")]
    SpawnFailed {
        worker_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker pool needs at least one worker")]
    NoWorkers,

    #[error("Worker pool has no sources to enrich")]
    NoSources,

    #[error("Worker setup failed: {0}")]
    Setup(#[from] crate::enrichment::EnrichmentError),
}

pub type Result<T> = std::result::Result<T, DataSearchError>;
