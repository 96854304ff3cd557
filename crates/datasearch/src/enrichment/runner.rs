//! The enrichment pass: fetch candidates, claim, execute, record.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use super::claim::{claim, ClaimOutcome};
use super::error::EnrichmentError;
use super::executor::{ExecutorRegistry, StageOutcome};
use super::state_machine::{RetryPolicy, StagePlan};
use super::status::{EnrichmentResult, EnrichmentStatus};
use super::transition::{record_outcome, Recorded, StageArtifacts, StageReport};
use crate::db::dataset_repo::{self, DatasetRow};
use crate::db::Database;

/// Error type recorded when an executor panics.
pub const EXECUTOR_PANIC: &str = "executor_panic";
/// Error type recorded when an executor returns unusable artifacts.
pub const INVALID_ARTIFACT: &str = "invalid_artifact";

/// Default number of candidates fetched per pass.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Counts for one pass over one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub source: String,
    pub task_id: String,
    pub candidates: usize,
    pub claimed: usize,
    pub conflicts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub skipped: usize,
    /// Records that reached `enriched` during this pass.
    pub completed: usize,
    /// Claimed records whose stage could not be run or recorded.
    pub errors: usize,
}

impl PassReport {
    /// True if the pass found nothing to do.
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    fn tally(&mut self, recorded: &Recorded) {
        match recorded.log.result {
            EnrichmentResult::Success => self.succeeded += 1,
            EnrichmentResult::Failed => self.failed += 1,
            EnrichmentResult::RateLimited => self.rate_limited += 1,
            EnrichmentResult::Skipped => self.skipped += 1,
        }
        if recorded.dataset.enrichment_status == EnrichmentStatus::Enriched {
            self.completed += 1;
        }
    }
}

/// Runs enrichment passes on behalf of one worker.
pub struct EnrichmentRunner {
    db: Database,
    registry: Arc<ExecutorRegistry>,
    plan: StagePlan,
    policy: RetryPolicy,
    batch_size: u32,
    worker_id: String,
}

impl EnrichmentRunner {
    /// Fails with [`EnrichmentError::MissingExecutor`] unless every stage of
    /// `plan` has an executor.
    pub fn new(
        db: Database,
        registry: Arc<ExecutorRegistry>,
        plan: StagePlan,
        policy: RetryPolicy,
        worker_id: impl Into<String>,
    ) -> Result<Self, EnrichmentError> {
        registry.covers(&plan)?;
        Ok(Self {
            db,
            registry,
            plan,
            policy,
            batch_size: DEFAULT_BATCH_SIZE,
            worker_id: worker_id.into(),
        })
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// One pass over `source_name`. Each claimable candidate gets at most
    /// one stage invocation. Lost claims are counted and skipped.
    pub fn run_pass(&self, source_name: &str) -> Result<PassReport, EnrichmentError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let _pass_span = info_span!("enrichment_pass",
            source = %source_name,
            worker_id = %self.worker_id,
            task_id = %task_id,
        )
        .entered();

        let candidates = dataset_repo::pending_for_enrichment(
            &self.db,
            source_name,
            self.batch_size,
            self.policy.max_attempts,
        )?;

        let mut report = PassReport {
            source: source_name.to_string(),
            task_id: task_id.clone(),
            candidates: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let row = match claim(&self.db, &candidate.id, &self.policy, Utc::now())? {
                ClaimOutcome::Claimed(row) => row,
                ClaimOutcome::Conflict => {
                    report.conflicts += 1;
                    continue;
                }
            };
            report.claimed += 1;

            match self.process_claimed(&row, &task_id) {
                Ok(recorded) => report.tally(&recorded),
                Err(e) => {
                    report.errors += 1;
                    warn!(dataset_id = %row.id, error = %e, "Releasing claim after error");
                    match self.release_after_error(&row, &task_id, &e) {
                        Ok(recorded) => report.tally(&recorded),
                        Err(release_err) => warn!(
                            dataset_id = %row.id,
                            error = %release_err,
                            "Claim not released, leaving it to the reaper"
                        ),
                    }
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                conflicts = report.conflicts,
                succeeded = report.succeeded,
                failed = report.failed,
                rate_limited = report.rate_limited,
                skipped = report.skipped,
                completed = report.completed,
                errors = report.errors,
                "Enrichment pass finished"
            );
        } else {
            debug!(candidates = report.candidates, "Nothing claimed");
        }
        Ok(report)
    }

    /// Runs the current stage of a record this worker has claimed and
    /// records the outcome.
    pub fn process_claimed(
        &self,
        row: &DatasetRow,
        task_id: &str,
    ) -> Result<Recorded, EnrichmentError> {
        let stage = self
            .plan
            .resolve(row.current_stage)
            .map_err(|e| EnrichmentError::transition(&row.id, e))?;
        let executor = self.registry.get(stage)?;

        let _stage_span = info_span!("stage", dataset_id = %row.id, stage = %stage).entered();

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| executor.execute(row)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                warn!(error = %message, "Stage executor panicked");
                StageOutcome::failed(EXECUTOR_PANIC, message)
            });
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut report = StageReport {
            dataset_id: row.id.clone(),
            stage,
            result: outcome.result,
            error_message: outcome.error_message,
            error_type: outcome.error_type,
            duration_ms: Some(duration_ms),
            worker_id: Some(self.worker_id.clone()),
            task_id: Some(task_id.to_string()),
            artifacts: outcome.artifacts,
        };

        match record_outcome(&self.db, &report, &self.plan, &self.policy, Utc::now()) {
            Err(EnrichmentError::InvalidArtifact { reason, .. }) => {
                warn!(error = %reason, "Discarding invalid stage artifacts");
                report.result = EnrichmentResult::Failed;
                report.error_message = Some(reason);
                report.error_type = Some(INVALID_ARTIFACT.to_string());
                report.artifacts = StageArtifacts::default();
                record_outcome(&self.db, &report, &self.plan, &self.policy, Utc::now())
            }
            other => other,
        }
    }

    /// Ends a claim whose stage could not be run or recorded as a `failed`
    /// attempt of the stage the record is on, tagged with the error kind.
    fn release_after_error(
        &self,
        row: &DatasetRow,
        task_id: &str,
        cause: &EnrichmentError,
    ) -> Result<Recorded, EnrichmentError> {
        let mut report = StageReport::new(
            row.id.clone(),
            self.plan.stage_of(row.current_stage),
            EnrichmentResult::Failed,
        );
        report.error_message = Some(cause.to_string());
        report.error_type = Some(cause.kind().to_string());
        report.worker_id = Some(self.worker_id.clone());
        report.task_id = Some(task_id.to_string());
        record_outcome(&self.db, &report, &self.plan, &self.policy, Utc::now())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}
