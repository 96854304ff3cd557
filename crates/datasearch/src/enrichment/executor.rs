//! Stage executors.
//!
//! An executor performs one stage against one dataset and reports what
//! happened. It does not touch the store; the runner records the outcome.

use super::error::EnrichmentError;
use super::state_machine::StagePlan;
use super::status::{EnrichmentResult, EnrichmentStage};
use super::transition::StageArtifacts;
use crate::db::dataset_repo::DatasetRow;

/// What an executor reports for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub result: EnrichmentResult,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub artifacts: StageArtifacts,
}

impl StageOutcome {
    pub fn success() -> Self {
        Self {
            result: EnrichmentResult::Success,
            error_message: None,
            error_type: None,
            artifacts: StageArtifacts::default(),
        }
    }

    pub fn failed(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            result: EnrichmentResult::Failed,
            error_message: Some(message.into()),
            error_type: Some(error_type.into()),
            artifacts: StageArtifacts::default(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            result: EnrichmentResult::RateLimited,
            error_message: Some(message.into()),
            error_type: Some("rate_limited".to_string()),
            artifacts: StageArtifacts::default(),
        }
    }

    /// The dataset is ineligible for this stage, e.g. it has no URL.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            result: EnrichmentResult::Skipped,
            error_message: Some(reason.into()),
            error_type: None,
            artifacts: StageArtifacts::default(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.artifacts.embedding = Some(embedding);
        self
    }

    pub fn with_static_score(mut self, score: f64) -> Self {
        self.artifacts.static_score = Some(score);
        self
    }
}

/// Performs one enrichment stage.
///
/// Called at most once per claim. Implementations must not panic for
/// ordinary failures; report them as [`StageOutcome::failed`] instead.
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> EnrichmentStage;
    fn execute(&self, dataset: &DatasetRow) -> StageOutcome;
}

/// Executor built from a closure.
pub struct FnExecutor<F> {
    stage: EnrichmentStage,
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&DatasetRow) -> StageOutcome + Send + Sync,
{
    pub fn new(stage: EnrichmentStage, f: F) -> Self {
        Self { stage, f }
    }
}

impl<F> StageExecutor for FnExecutor<F>
where
    F: Fn(&DatasetRow) -> StageOutcome + Send + Sync,
{
    fn stage(&self) -> EnrichmentStage {
        self.stage
    }

    fn execute(&self, dataset: &DatasetRow) -> StageOutcome {
        (self.f)(dataset)
    }
}

/// Routes each stage to its executor.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: Vec<Box<dyn StageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor, replacing any earlier one for the same stage.
    pub fn register(&mut self, executor: Box<dyn StageExecutor>) -> &mut Self {
        let stage = executor.stage();
        self.executors.retain(|e| e.stage() != stage);
        self.executors.push(executor);
        self
    }

    pub fn with(mut self, executor: impl StageExecutor + 'static) -> Self {
        self.register(Box::new(executor));
        self
    }

    pub fn get(&self, stage: EnrichmentStage) -> Result<&dyn StageExecutor, EnrichmentError> {
        self.executors
            .iter()
            .find(|e| e.stage() == stage)
            .map(|e| e.as_ref())
            .ok_or(EnrichmentError::MissingExecutor(stage))
    }

    /// Checks that every stage of `plan` has an executor.
    pub fn covers(&self, plan: &StagePlan) -> Result<(), EnrichmentError> {
        for stage in plan.stages() {
            self.get(*stage)?;
        }
        Ok(())
    }

    pub fn stages(&self) -> Vec<EnrichmentStage> {
        self.executors.iter().map(|e| e.stage()).collect()
    }
}
