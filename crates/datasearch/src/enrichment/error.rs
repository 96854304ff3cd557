//! Enrichment error types.

use thiserror::Error;

use super::state_machine::TransitionError;
use super::status::EnrichmentStage;
use crate::db::DatabaseError;

/// Errors from claiming, transitioning and running enrichment.
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Another worker holds the record, or it is no longer claimable.
    #[error("Dataset '{0}' could not be claimed")]
    ClaimConflict(String),

    #[error("Dataset '{0}' not found")]
    DatasetNotFound(String),

    #[error("Invalid transition for dataset '{dataset_id}': {source}")]
    Transition {
        dataset_id: String,
        #[source]
        source: TransitionError,
    },

    /// A report named a stage other than the one the record is on.
    #[error("Dataset '{dataset_id}' is on stage '{expected}', not '{reported}'")]
    StageMismatch {
        dataset_id: String,
        expected: EnrichmentStage,
        reported: EnrichmentStage,
    },

    #[error("No executor registered for stage '{0}'")]
    MissingExecutor(EnrichmentStage),

    #[error("Invalid artifact from stage '{stage}': {reason}")]
    InvalidArtifact {
        stage: EnrichmentStage,
        reason: String,
    },
}

impl EnrichmentError {
    /// Short tag stored as the log `error_type` when a claim is released
    /// because of this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "storage_error",
            Self::ClaimConflict(_) => "claim_conflict",
            Self::DatasetNotFound(_) => "dataset_not_found",
            Self::Transition {
                source: TransitionError::StageNotInPlan(_),
                ..
            } => "stage_not_in_plan",
            Self::Transition { .. } => "invalid_transition",
            Self::StageMismatch { .. } => "stage_mismatch",
            Self::MissingExecutor(_) => "missing_executor",
            Self::InvalidArtifact { .. } => "invalid_artifact",
        }
    }

    pub(crate) fn transition(dataset_id: &str, source: TransitionError) -> Self {
        Self::Transition {
            dataset_id: dataset_id.to_string(),
            source,
        }
    }
}
