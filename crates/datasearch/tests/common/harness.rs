//! Test harness for isolated test execution.
//!
//! Each `TestHarness` owns a temp directory with its own SQLite file, so
//! tests can open several independent `Database` handles on the same store
//! the way separate worker processes would.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use datasearch::db::dataset_repo::{self, DatasetRow, NewDataset};
use datasearch::db::enrichment_log_repo::{self, LogEntry};
use datasearch::enrichment::{EnrichmentRunner, ExecutorRegistry, RetryPolicy, StagePlan};
use datasearch::Database;

/// Fixed reference time for tests that need deterministic timestamps.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub db: Database,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("data").join("datasearch.db");
        let db = Database::open(&db_path).expect("Failed to open test database");
        Self {
            temp_dir,
            db_path,
            db,
        }
    }

    /// Opens another handle on the same file, with its own connections.
    pub fn open_handle(&self) -> Database {
        Database::open(&self.db_path).expect("Failed to open second handle")
    }

    pub fn temp_path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    /// Inserts `count` minimal datasets for `source` and returns them.
    pub fn seed(&self, source: &str, count: usize) -> Vec<DatasetRow> {
        (0..count)
            .map(|i| {
                dataset_repo::upsert(
                    &self.db,
                    &NewDataset::new(
                        source,
                        format!("{source}/dataset-{i}"),
                        format!("Dataset {i}"),
                        format!("https://{source}.example/d/{i}"),
                    ),
                    t0(),
                )
                .expect("Failed to seed dataset")
            })
            .collect()
    }

    pub fn dataset(&self, id: &str) -> DatasetRow {
        dataset_repo::find_by_id(&self.db, id)
            .expect("lookup failed")
            .expect("dataset missing")
    }

    pub fn logs(&self, id: &str) -> Vec<LogEntry> {
        enrichment_log_repo::find_by_dataset(&self.db, id, 1000).expect("log lookup failed")
    }

    pub fn runner(
        &self,
        registry: Arc<ExecutorRegistry>,
        plan: StagePlan,
        policy: RetryPolicy,
        worker_id: &str,
    ) -> EnrichmentRunner {
        EnrichmentRunner::new(self.db.clone(), registry, plan, policy, worker_id)
            .expect("Failed to build runner")
    }
}
