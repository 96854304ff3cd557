//! Read-only, time-windowed aggregates over the enrichment log.
//!
//! Every query here runs on the read connection, so operators can inspect a
//! busy database without queueing behind claim and transition writes.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::enrichment_log_repo::LogEntry;
use super::{format_timestamp, timestamp_column, Database, DatabaseError};
use crate::enrichment::status::{EnrichmentResult, EnrichmentStage};

/// Attempt count and mean duration for one (stage, result) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResultStat {
    pub stage: EnrichmentStage,
    pub result: EnrichmentResult,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<f64>,
}

/// How often an error type occurred in the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrequency {
    pub error_type: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

/// Counts and average durations grouped by (stage, result) since `since`.
pub fn stats_by_stage_and_result(
    db: &Database,
    since: DateTime<Utc>,
) -> Result<Vec<StageResultStat>, DatabaseError> {
    db.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT stage, result, COUNT(*), AVG(duration_ms)
             FROM dataset_enrichment_logs
             WHERE created_at >= ?1
             GROUP BY stage, result
             ORDER BY stage, result",
        )?;
        let rows = stmt
            .query_map(params![format_timestamp(&since)], |row| {
                Ok(StageResultStat {
                    stage: row.get(0)?,
                    result: row.get(1)?,
                    count: row.get(2)?,
                    avg_duration_ms: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Most frequent error types since `since`, by descending count. Ties go to
/// the type seen most recently, then to the type name.
pub fn top_errors(
    db: &Database,
    since: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<ErrorFrequency>, DatabaseError> {
    db.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT error_type, COUNT(*) AS occurrences, MAX(created_at) AS last_seen
             FROM dataset_enrichment_logs
             WHERE created_at >= ?1
               AND result IN ('failed', 'rate_limited')
               AND error_type IS NOT NULL
             GROUP BY error_type
             ORDER BY occurrences DESC, last_seen DESC, error_type ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![format_timestamp(&since), limit], |row| {
                Ok(ErrorFrequency {
                    error_type: row.get("error_type")?,
                    count: row.get("occurrences")?,
                    last_seen: timestamp_column(row, "last_seen")?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Raw `failed` entries since `since`, newest first.
pub fn failed_logs(
    db: &Database,
    since: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<LogEntry>, DatabaseError> {
    db.with_reader(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM dataset_enrichment_logs
             WHERE result = 'failed' AND created_at >= ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![format_timestamp(&since), limit], LogEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
