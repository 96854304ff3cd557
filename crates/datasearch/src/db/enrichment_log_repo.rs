//! Enrichment log repository for the `dataset_enrichment_logs` table.
//!
//! One row per concluded stage attempt. Rows are append-only: the schema
//! trigger rejects any update other than `updated_at`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::{format_timestamp, timestamp_column, Database, DatabaseError};
use crate::enrichment::status::{EnrichmentResult, EnrichmentStage};

/// A log entry about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub dataset_id: String,
    pub stage: EnrichmentStage,
    pub result: EnrichmentResult,
    pub attempt_number: u32,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: Option<u64>,
    pub worker_id: Option<String>,
    pub task_id: Option<String>,
}

/// A stored log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub dataset_id: String,
    pub stage: EnrichmentStage,
    pub result: EnrichmentResult,
    pub attempt_number: u32,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: Option<u64>,
    pub worker_id: Option<String>,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LogEntry {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            dataset_id: row.get("dataset_id")?,
            stage: row.get("stage")?,
            result: row.get("result")?,
            attempt_number: row.get("attempt_number")?,
            error_message: row.get("error_message")?,
            error_type: row.get("error_type")?,
            duration_ms: row.get("duration_ms")?,
            worker_id: row.get("worker_id")?,
            task_id: row.get("task_id")?,
            created_at: timestamp_column(row, "created_at")?,
            updated_at: timestamp_column(row, "updated_at")?,
        })
    }
}

/// Query filter for log listing.
#[derive(Debug, Default, Clone)]
pub struct LogFilter {
    pub dataset_id: Option<String>,
    pub stage: Option<EnrichmentStage>,
    pub result: Option<EnrichmentResult>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Appends a log entry on the given connection.
///
/// Takes a `Connection` rather than a `Database` so callers can write the
/// entry inside the same transaction as the status change it records.
pub(crate) fn insert(
    conn: &Connection,
    entry: &NewLogEntry,
    now: DateTime<Utc>,
) -> Result<LogEntry, DatabaseError> {
    let row = conn.query_row(
        "INSERT INTO dataset_enrichment_logs (id, dataset_id, stage, result, attempt_number,
         error_message, error_type, duration_ms, worker_id, task_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
         RETURNING *",
        params![
            uuid::Uuid::new_v4().to_string(),
            entry.dataset_id,
            entry.stage,
            entry.result,
            entry.attempt_number,
            entry.error_message,
            entry.error_type,
            entry.duration_ms,
            entry.worker_id,
            entry.task_id,
            format_timestamp(&now),
        ],
        LogEntry::from_row,
    )?;
    Ok(row)
}

/// Lists log entries matching `filter`, newest first.
pub fn query(db: &Database, filter: &LogFilter) -> Result<Vec<LogEntry>, DatabaseError> {
    db.with_reader(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref dataset_id) = filter.dataset_id {
            conditions.push(format!("dataset_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(dataset_id.clone()));
        }
        if let Some(stage) = filter.stage {
            conditions.push(format!("stage = ?{}", param_values.len() + 1));
            param_values.push(Box::new(stage));
        }
        if let Some(result) = filter.result {
            conditions.push(format!("result = ?{}", param_values.len() + 1));
            param_values.push(Box::new(result));
        }
        if let Some(ref since) = filter.since {
            conditions.push(format!("created_at >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(format_timestamp(since)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        param_values.push(Box::new(filter.limit.unwrap_or(100)));
        let sql = format!(
            "SELECT * FROM dataset_enrichment_logs {}
             ORDER BY created_at DESC, attempt_number DESC, id DESC LIMIT ?{}",
            where_clause,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), LogEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// History of one dataset, newest first.
pub fn find_by_dataset(
    db: &Database,
    dataset_id: &str,
    limit: u32,
) -> Result<Vec<LogEntry>, DatabaseError> {
    query(
        db,
        &LogFilter {
            dataset_id: Some(dataset_id.to_string()),
            limit: Some(limit),
            ..Default::default()
        },
    )
}

/// Number of logged attempts of `stage` against a dataset.
pub fn count_attempts(
    db: &Database,
    dataset_id: &str,
    stage: EnrichmentStage,
) -> Result<u64, DatabaseError> {
    db.with_reader(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM dataset_enrichment_logs WHERE dataset_id = ?1 AND stage = ?2",
            params![dataset_id, stage],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Bumps the last-touched timestamp of an entry. Returns `false` if it does
/// not exist.
pub fn touch(db: &Database, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE dataset_enrichment_logs SET updated_at = ?2 WHERE id = ?1",
            params![id, format_timestamp(&now)],
        )?;
        Ok(changed > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dataset_repo::{self, NewDataset};
    use chrono::{Duration, TimeZone};

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn seed_dataset(db: &Database) -> String {
        dataset_repo::upsert(
            db,
            &NewDataset::new("kaggle", "a/1", "A", "https://kaggle.com/a"),
            t0(),
        )
        .unwrap()
        .id
    }

    fn sample_entry(dataset_id: &str, stage: EnrichmentStage, attempt: u32) -> NewLogEntry {
        NewLogEntry {
            dataset_id: dataset_id.to_string(),
            stage,
            result: EnrichmentResult::Failed,
            attempt_number: attempt,
            error_message: Some("HTTP 500".to_string()),
            error_type: Some("http_error".to_string()),
            duration_ms: Some(120),
            worker_id: Some("worker-1".to_string()),
            task_id: Some("task-1".to_string()),
        }
    }

    #[test]
    fn test_insert_and_find_by_dataset() {
        let db = test_db();
        let id = seed_dataset(&db);

        db.with_conn(|conn| {
            insert(conn, &sample_entry(&id, EnrichmentStage::ApiMetadata, 1), t0())?;
            insert(
                conn,
                &sample_entry(&id, EnrichmentStage::ApiMetadata, 2),
                t0() + Duration::minutes(5),
            )?;
            Ok(())
        })
        .unwrap();

        let history = find_by_dataset(&db, &id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attempt_number, 2);
        assert_eq!(history[1].attempt_number, 1);
        assert_eq!(history[0].duration_ms, Some(120));
        assert_eq!(history[0].worker_id.as_deref(), Some("worker-1"));

        assert_eq!(find_by_dataset(&db, &id, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_insert_requires_existing_dataset() {
        let db = test_db();
        let result = db.with_conn(|conn| {
            insert(conn, &sample_entry("ghost", EnrichmentStage::Embedding, 1), t0())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_count_attempts_per_stage() {
        let db = test_db();
        let id = seed_dataset(&db);
        db.with_conn(|conn| {
            insert(conn, &sample_entry(&id, EnrichmentStage::ApiMetadata, 1), t0())?;
            insert(conn, &sample_entry(&id, EnrichmentStage::Embedding, 2), t0())?;
            insert(conn, &sample_entry(&id, EnrichmentStage::Embedding, 3), t0())?;
            Ok(())
        })
        .unwrap();

        assert_eq!(count_attempts(&db, &id, EnrichmentStage::ApiMetadata).unwrap(), 1);
        assert_eq!(count_attempts(&db, &id, EnrichmentStage::Embedding).unwrap(), 2);
        assert_eq!(count_attempts(&db, &id, EnrichmentStage::StaticScore).unwrap(), 0);
    }

    #[test]
    fn test_query_filters() {
        let db = test_db();
        let id = seed_dataset(&db);
        db.with_conn(|conn| {
            insert(conn, &sample_entry(&id, EnrichmentStage::ApiMetadata, 1), t0())?;
            let mut ok = sample_entry(&id, EnrichmentStage::ApiMetadata, 2);
            ok.result = EnrichmentResult::Success;
            ok.error_message = None;
            ok.error_type = None;
            insert(conn, &ok, t0() + Duration::hours(2))?;
            Ok(())
        })
        .unwrap();

        let failed = query(
            &db,
            &LogFilter {
                result: Some(EnrichmentResult::Failed),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempt_number, 1);

        let recent = query(
            &db,
            &LogFilter {
                since: Some(t0() + Duration::hours(1)),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].result, EnrichmentResult::Success);
    }

    #[test]
    fn test_touch_only_changes_updated_at() {
        let db = test_db();
        let id = seed_dataset(&db);
        let entry = db
            .with_conn(|conn| insert(conn, &sample_entry(&id, EnrichmentStage::ApiMetadata, 1), t0()))
            .unwrap();

        assert!(touch(&db, &entry.id, t0() + Duration::hours(1)).unwrap());
        assert!(!touch(&db, "missing", t0()).unwrap());

        let stored = find_by_dataset(&db, &id, 10).unwrap().remove(0);
        assert_eq!(stored.updated_at, t0() + Duration::hours(1));
        assert_eq!(stored.created_at, t0());
        assert_eq!(stored.result, EnrichmentResult::Failed);
    }

    #[test]
    fn test_result_cannot_be_rewritten() {
        let db = test_db();
        let id = seed_dataset(&db);
        let entry = db
            .with_conn(|conn| insert(conn, &sample_entry(&id, EnrichmentStage::ApiMetadata, 1), t0()))
            .unwrap();

        let result = db.with_conn(|conn| {
            conn.execute(
                "UPDATE dataset_enrichment_logs SET result = 'success' WHERE id = ?1",
                params![entry.id],
            )?;
            Ok(())
        });
        assert!(result.is_err());
    }
}
