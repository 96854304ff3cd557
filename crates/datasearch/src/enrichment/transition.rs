//! Persisted transitions.
//!
//! Every exit from `enriching` is written here: the envelope change, any
//! stage artifacts and exactly one log entry commit in one `IMMEDIATE`
//! transaction, or none of them do.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use super::error::EnrichmentError;
use super::state_machine::{
    conclude_stage, expire_claim, next_status, Envelope, ErrorUpdate, Event, Exit, RetryPolicy,
    StagePlan, TransitionError, ATTEMPTS_EXHAUSTED,
};
use super::status::{EnrichmentResult, EnrichmentStage, EnrichmentStatus};
use crate::db::dataset_repo::{self, DatasetRow, EnvelopeWrite, EMBEDDING_DIMENSIONS};
use crate::db::enrichment_log_repo::{self, LogEntry, NewLogEntry};
use crate::db::Database;

/// Error type recorded when a claim times out.
pub const CLAIM_EXPIRED: &str = "claim_expired";

/// Outputs a successful stage may hand back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageArtifacts {
    pub embedding: Option<Vec<f32>>,
    pub static_score: Option<f64>,
}

impl StageArtifacts {
    pub fn is_empty(&self) -> bool {
        self.embedding.is_none() && self.static_score.is_none()
    }
}

/// The concluded attempt of one stage on one claimed record.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub dataset_id: String,
    pub stage: EnrichmentStage,
    pub result: EnrichmentResult,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: Option<u64>,
    pub worker_id: Option<String>,
    pub task_id: Option<String>,
    pub artifacts: StageArtifacts,
}

impl StageReport {
    pub fn new(
        dataset_id: impl Into<String>,
        stage: EnrichmentStage,
        result: EnrichmentResult,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            stage,
            result,
            error_message: None,
            error_type: None,
            duration_ms: None,
            worker_id: None,
            task_id: None,
            artifacts: StageArtifacts::default(),
        }
    }

    fn error_text(&self) -> String {
        self.error_message
            .as_deref()
            .or(self.error_type.as_deref())
            .unwrap_or(self.result.as_str())
            .to_string()
    }
}

/// A committed transition: the record as it now stands and its new log row.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub dataset: DatasetRow,
    pub log: LogEntry,
}

fn validate_artifacts(report: &StageReport) -> Result<(), EnrichmentError> {
    if let Some(ref embedding) = report.artifacts.embedding {
        if embedding.len() != EMBEDDING_DIMENSIONS {
            return Err(EnrichmentError::InvalidArtifact {
                stage: report.stage,
                reason: format!(
                    "embedding has {} dimensions, expected {}",
                    embedding.len(),
                    EMBEDDING_DIMENSIONS
                ),
            });
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(EnrichmentError::InvalidArtifact {
                stage: report.stage,
                reason: "embedding contains non-finite values".to_string(),
            });
        }
    }
    if let Some(score) = report.artifacts.static_score {
        if !score.is_finite() {
            return Err(EnrichmentError::InvalidArtifact {
                stage: report.stage,
                reason: format!("static score {} is not finite", score),
            });
        }
    }
    Ok(())
}

fn load(conn: &Connection, dataset_id: &str) -> Result<DatasetRow, EnrichmentError> {
    dataset_repo::find_by_id_on(conn, dataset_id)?
        .ok_or_else(|| EnrichmentError::DatasetNotFound(dataset_id.to_string()))
}

/// Applies an exit computed by the state machine and appends its log entry.
fn commit_exit(
    conn: &Connection,
    row: &DatasetRow,
    exit: &Exit,
    error_text: Option<&str>,
    log: NewLogEntry,
    now: DateTime<Utc>,
) -> Result<Recorded, EnrichmentError> {
    let last_error = match exit.error {
        ErrorUpdate::Keep => row.last_enrichment_error.as_deref(),
        ErrorUpdate::Clear => None,
        ErrorUpdate::Set => error_text,
        ErrorUpdate::Exhausted => Some(ATTEMPTS_EXHAUSTED),
    };

    let changed = dataset_repo::write_envelope(
        conn,
        &EnvelopeWrite {
            id: &row.id,
            expected: EnrichmentStatus::Enriching,
            status: exit.status,
            attempts: exit.attempts,
            current_stage: exit.current_stage,
            last_error,
            last_enriched_at: exit.completed.then_some(now),
            now,
        },
    )?;
    if changed != 1 {
        return Err(EnrichmentError::transition(
            &row.id,
            TransitionError::InvariantViolation {
                from: row.enrichment_status,
                event: "write_envelope",
            },
        ));
    }

    let log = enrichment_log_repo::insert(conn, &log, now)?;
    let dataset = load(conn, &row.id)?;
    Ok(Recorded { dataset, log })
}

/// Records the outcome of a stage on a claimed record.
///
/// Fails without writing anything if the record is not `enriching`
/// (a [`TransitionError::InvariantViolation`]) or if the report is for a
/// different stage than the one the record is on.
pub fn record_outcome(
    db: &Database,
    report: &StageReport,
    plan: &StagePlan,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Recorded, EnrichmentError> {
    validate_artifacts(report)?;

    let recorded = db.with_transaction(|tx| {
        let row = load(tx, &report.dataset_id)?;

        if row.enrichment_status == EnrichmentStatus::Enriching {
            let expected = plan.stage_of(row.current_stage);
            if expected != report.stage {
                return Err(EnrichmentError::StageMismatch {
                    dataset_id: row.id.clone(),
                    expected,
                    reported: report.stage,
                });
            }
        }

        let exit = conclude_stage(Envelope::from(&row), report.stage, report.result, plan, policy)
            .map_err(|e| EnrichmentError::transition(&row.id, e))?;

        if report.result == EnrichmentResult::Success && !report.artifacts.is_empty() {
            dataset_repo::write_artifacts(
                tx,
                &row.id,
                report.artifacts.embedding.as_deref(),
                report.artifacts.static_score,
            )?;
        }

        let error_text = report.error_text();
        commit_exit(
            tx,
            &row,
            &exit,
            Some(&error_text),
            NewLogEntry {
                dataset_id: row.id.clone(),
                stage: report.stage,
                result: report.result,
                attempt_number: exit.attempts,
                error_message: report.error_message.clone(),
                error_type: report.error_type.clone(),
                duration_ms: report.duration_ms,
                worker_id: report.worker_id.clone(),
                task_id: report.task_id.clone(),
            },
            now,
        )
    })?;

    log::debug!(
        "Dataset {} stage {} -> {} ({}), attempt {}",
        recorded.dataset.id,
        report.stage,
        report.result,
        recorded.dataset.enrichment_status,
        recorded.log.attempt_number
    );
    Ok(recorded)
}

/// Releases an expired claim: back to `pending`, or `failed` once the
/// attempt budget is spent. Logged as a failed attempt of the record's
/// current stage.
pub(crate) fn release_expired(
    db: &Database,
    dataset_id: &str,
    plan: &StagePlan,
    policy: &RetryPolicy,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<Recorded>, EnrichmentError> {
    db.with_transaction(|tx| {
        let row = load(tx, dataset_id)?;

        // Reported, or re-claimed, since the scan.
        let still_stale = row.enrichment_status == EnrichmentStatus::Enriching
            && row.last_checked_at.map_or(true, |checked| checked < cutoff);
        if !still_stale {
            return Ok(None);
        }

        let stage = plan.stage_of(row.current_stage);
        let exit = expire_claim(Envelope::from(&row), policy)
            .map_err(|e| EnrichmentError::transition(&row.id, e))?;

        let message = format!("claim not reported before {}", cutoff.to_rfc3339());
        let recorded = commit_exit(
            tx,
            &row,
            &exit,
            Some(&message),
            NewLogEntry {
                dataset_id: row.id.clone(),
                stage,
                result: EnrichmentResult::Failed,
                attempt_number: exit.attempts,
                error_message: Some(message.clone()),
                error_type: Some(CLAIM_EXPIRED.to_string()),
                duration_ms: None,
                worker_id: None,
                task_id: None,
            },
            now,
        )?;
        Ok(Some(recorded))
    })
}

/// Queues a never-enriched record: `minimal → pending`.
pub fn queue_for_enrichment(
    db: &Database,
    dataset_id: &str,
    now: DateTime<Utc>,
) -> Result<DatasetRow, EnrichmentError> {
    db.with_transaction(|tx| {
        let row = load(tx, dataset_id)?;
        next_status(row.enrichment_status, Event::Queue)
            .map_err(|e| EnrichmentError::transition(&row.id, e))?;
        dataset_repo::mark_pending(tx, &row.id, now)?;
        load(tx, &row.id)
    })
}

/// Queues every active `minimal` record of a source. Returns how many moved.
pub fn queue_source(
    db: &Database,
    source_name: &str,
    now: DateTime<Utc>,
) -> Result<usize, EnrichmentError> {
    let queued = db.with_conn(|conn| dataset_repo::mark_source_pending(conn, source_name, now))?;
    log::info!("Queued {} datasets from source '{}'", queued, source_name);
    Ok(queued)
}

/// Operator reset. Returns a record to `pending` with a fresh attempt
/// budget, no error, no stage progress, and reactivates it. Refused while
/// the record is claimed. Writes no log entry.
pub fn reactivate(
    db: &Database,
    dataset_id: &str,
    now: DateTime<Utc>,
) -> Result<DatasetRow, EnrichmentError> {
    db.with_transaction(|tx| {
        let row = load(tx, dataset_id)?;
        if row.enrichment_status == EnrichmentStatus::Enriching {
            return Err(EnrichmentError::transition(
                &row.id,
                TransitionError::InvariantViolation {
                    from: row.enrichment_status,
                    event: "reactivate",
                },
            ));
        }
        dataset_repo::reset_envelope(tx, &row.id, now)?;
        log::info!(
            "Reactivated dataset {} (was {} after {} attempts)",
            row.id,
            row.enrichment_status,
            row.enrichment_attempts
        );
        load(tx, &row.id)
    })
}
