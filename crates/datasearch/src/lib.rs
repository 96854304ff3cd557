pub mod config;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod logging;
pub mod worker;

pub use config::{load_config, Config, EnrichmentConfig, LoggingConfig};
pub use db::dataset_repo::{DatasetRow, NewDataset, SourceStats};
pub use db::enrichment_log_repo::LogEntry;
pub use db::{Database, DatabaseError};
pub use enrichment::{
    ClaimOutcome, EnrichmentError, EnrichmentResult, EnrichmentRunner, EnrichmentStage,
    EnrichmentStatus, ExecutorRegistry, RetryMode, RetryPolicy, StageExecutor, StageOutcome,
    StagePlan,
};
pub use error::{ConfigError, DataSearchError, Result, WorkerError};
pub use logging::init_logging;
pub use worker::{PoolSettings, WorkerPool};
