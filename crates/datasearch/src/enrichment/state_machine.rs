//! The enrichment state machine.
//!
//! Pure functions only: given the current envelope and an event, compute
//! the next envelope or reject the event. Persisting the result is the job
//! of [`super::claim`] and [`super::transition`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::status::{EnrichmentResult, EnrichmentStage, EnrichmentStatus};
use crate::db::dataset_repo::DatasetRow;

/// Stored as `last_enrichment_error` when a record spends its last attempt
/// on a stage that was not the final one.
pub const ATTEMPTS_EXHAUSTED: &str = "attempt budget exhausted before all stages ran";

/// A status change that the state machine does not allow.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot apply '{event}' to a record in status '{from}'")]
    InvariantViolation {
        from: EnrichmentStatus,
        event: &'static str,
    },

    #[error("Stage '{0}' is not part of the configured pipeline")]
    StageNotInPlan(EnrichmentStage),

    #[error("Invalid stage plan: {0}")]
    InvalidPlan(String),
}

/// What to do with a record after a retryable failure while it still has
/// attempts left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Leave it `failed`. It stays claimable until the attempt budget runs out.
    #[default]
    Park,
    /// Put it straight back to `pending`.
    Requeue,
}

/// Decides between retryable and terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Every stage invocation consumes one attempt.
    pub max_attempts: u32,
    pub on_failure: RetryMode,
    pub on_rate_limit: RetryMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            on_failure: RetryMode::Park,
            on_rate_limit: RetryMode::Park,
        }
    }
}

impl RetryPolicy {
    /// Whether a record with `attempts` (already incremented) may run again.
    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    fn mode_for(&self, result: EnrichmentResult) -> RetryMode {
        match result {
            EnrichmentResult::RateLimited => self.on_rate_limit,
            _ => self.on_failure,
        }
    }
}

/// The ordered list of stages a record goes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<EnrichmentStage>,
}

impl StagePlan {
    pub fn new(stages: Vec<EnrichmentStage>) -> Result<Self, TransitionError> {
        if stages.is_empty() {
            return Err(TransitionError::InvalidPlan("no stages".to_string()));
        }
        for (i, stage) in stages.iter().enumerate() {
            if stages[..i].contains(stage) {
                return Err(TransitionError::InvalidPlan(format!(
                    "stage '{}' listed twice",
                    stage
                )));
            }
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[EnrichmentStage] {
        &self.stages
    }

    pub fn first(&self) -> EnrichmentStage {
        self.stages[0]
    }

    /// The stage a record should run next. `None` means it has not started.
    pub fn resolve(
        &self,
        current: Option<EnrichmentStage>,
    ) -> Result<EnrichmentStage, TransitionError> {
        match current {
            None => Ok(self.first()),
            Some(stage) if self.stages.contains(&stage) => Ok(stage),
            Some(stage) => Err(TransitionError::StageNotInPlan(stage)),
        }
    }

    /// The stage a record is on, whether or not the plan still lists it.
    pub fn stage_of(&self, current: Option<EnrichmentStage>) -> EnrichmentStage {
        current.unwrap_or_else(|| self.first())
    }

    /// The stage after `stage`, or `None` if it is the last one.
    pub fn after(&self, stage: EnrichmentStage) -> Result<Option<EnrichmentStage>, TransitionError> {
        let index = self
            .stages
            .iter()
            .position(|s| *s == stage)
            .ok_or(TransitionError::StageNotInPlan(stage))?;
        Ok(self.stages.get(index + 1).copied())
    }
}

impl Default for StagePlan {
    fn default() -> Self {
        Self {
            stages: EnrichmentStage::ALL.to_vec(),
        }
    }
}

/// Something that happens to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Explicitly queue a never-enriched record.
    Queue,
    /// A worker takes ownership.
    Claim,
    /// The current stage succeeded. `more_stages` is true if the plan goes on.
    StageSucceeded { more_stages: bool },
    /// A non-final stage succeeded on the last attempt of the budget.
    BudgetExhausted,
    /// The current stage failed or was rate-limited.
    StageFailed { retry_now: bool },
    /// The record is ineligible for the current stage.
    StageSkipped,
    /// The claim outlived its timeout.
    ClaimExpired { retry_now: bool },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Queue => "queue",
            Event::Claim => "claim",
            Event::StageSucceeded { .. } => "stage_succeeded",
            Event::BudgetExhausted => "budget_exhausted",
            Event::StageFailed { .. } => "stage_failed",
            Event::StageSkipped => "stage_skipped",
            Event::ClaimExpired { .. } => "claim_expired",
        }
    }
}

/// The status transition table.
pub fn next_status(
    from: EnrichmentStatus,
    event: Event,
) -> Result<EnrichmentStatus, TransitionError> {
    use EnrichmentStatus::*;

    let to = match (from, event) {
        (Minimal, Event::Queue) => Pending,
        (Minimal | Pending | Failed, Event::Claim) => Enriching,
        (Enriching, Event::StageSucceeded { more_stages: true }) => Pending,
        (Enriching, Event::StageSucceeded { more_stages: false }) => Enriched,
        (Enriching, Event::BudgetExhausted) => Failed,
        (Enriching, Event::StageFailed { retry_now: true }) => Pending,
        (Enriching, Event::StageFailed { retry_now: false }) => Failed,
        (Enriching, Event::StageSkipped) => Skipped,
        (Enriching, Event::ClaimExpired { retry_now: true }) => Pending,
        (Enriching, Event::ClaimExpired { retry_now: false }) => Failed,
        (from, event) => {
            return Err(TransitionError::InvariantViolation {
                from,
                event: event.name(),
            })
        }
    };
    Ok(to)
}

/// The envelope fields the state machine reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub status: EnrichmentStatus,
    pub attempts: u32,
    pub current_stage: Option<EnrichmentStage>,
}

impl From<&DatasetRow> for Envelope {
    fn from(row: &DatasetRow) -> Self {
        Self {
            status: row.enrichment_status,
            attempts: row.enrichment_attempts,
            current_stage: row.current_stage,
        }
    }
}

/// How `last_enrichment_error` changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorUpdate {
    Keep,
    Clear,
    /// Replace with the reported error.
    Set,
    /// Replace with [`ATTEMPTS_EXHAUSTED`].
    Exhausted,
}

/// The envelope a record leaves `enriching` with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub status: EnrichmentStatus,
    pub attempts: u32,
    pub current_stage: Option<EnrichmentStage>,
    pub error: ErrorUpdate,
    /// Stamp `last_enriched_at`.
    pub completed: bool,
}

/// Computes the exit for a stage report on a claimed record.
///
/// `stage` must be the stage the record is on; attempts always grow by one.
pub fn conclude_stage(
    envelope: Envelope,
    stage: EnrichmentStage,
    result: EnrichmentResult,
    plan: &StagePlan,
    policy: &RetryPolicy,
) -> Result<Exit, TransitionError> {
    let attempts = envelope.attempts.saturating_add(1);

    let (event, current_stage, error) = match result {
        EnrichmentResult::Success => match plan.after(stage)? {
            // No attempt left to run `next`.
            Some(next) if !policy.has_attempts_left(attempts) => {
                (Event::BudgetExhausted, Some(next), ErrorUpdate::Exhausted)
            }
            Some(next) => (
                Event::StageSucceeded { more_stages: true },
                Some(next),
                ErrorUpdate::Keep,
            ),
            None => (
                Event::StageSucceeded { more_stages: false },
                None,
                ErrorUpdate::Clear,
            ),
        },
        EnrichmentResult::Failed | EnrichmentResult::RateLimited => {
            let retry_now = policy.has_attempts_left(attempts)
                && policy.mode_for(result) == RetryMode::Requeue;
            (
                Event::StageFailed { retry_now },
                Some(stage),
                ErrorUpdate::Set,
            )
        }
        EnrichmentResult::Skipped => (Event::StageSkipped, Some(stage), ErrorUpdate::Keep),
    };

    let status = next_status(envelope.status, event)?;
    Ok(Exit {
        status,
        attempts,
        current_stage,
        error,
        completed: status == EnrichmentStatus::Enriched,
    })
}

/// Computes the exit for a claim that expired without a report.
pub fn expire_claim(envelope: Envelope, policy: &RetryPolicy) -> Result<Exit, TransitionError> {
    let attempts = envelope.attempts.saturating_add(1);
    let retry_now = policy.has_attempts_left(attempts);
    let status = next_status(envelope.status, Event::ClaimExpired { retry_now })?;
    Ok(Exit {
        status,
        attempts,
        current_stage: envelope.current_stage,
        error: ErrorUpdate::Set,
        completed: false,
    })
}
