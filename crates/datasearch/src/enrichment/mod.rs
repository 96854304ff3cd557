//! Dataset enrichment: the claim protocol, the state machine and the
//! machinery that drives records through the configured stages.
//!
//! Status changes happen only through this module. The storage functions
//! that write the enrichment envelope are crate-private and are reached via
//! [`claim::claim`], [`transition`] and [`reaper`].

pub mod claim;
pub mod error;
pub mod executor;
pub mod reaper;
pub mod runner;
pub mod state_machine;
pub mod status;
pub mod transition;

pub use claim::{claim, ClaimOutcome};
pub use error::EnrichmentError;
pub use executor::{ExecutorRegistry, FnExecutor, StageExecutor, StageOutcome};
pub use reaper::{requeue_stale, ReapReport};
pub use runner::{EnrichmentRunner, PassReport};
pub use state_machine::{RetryMode, RetryPolicy, StagePlan, TransitionError, ATTEMPTS_EXHAUSTED};
pub use status::{EnrichmentResult, EnrichmentStage, EnrichmentStatus};
pub use transition::{
    queue_for_enrichment, queue_source, reactivate, record_outcome, Recorded, StageArtifacts,
    StageReport,
};
