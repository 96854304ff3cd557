//! Claim protocol.
//!
//! A claim is the single conditional update in
//! [`dataset_repo::mark_enriching`]. Losing the race is an ordinary outcome,
//! not an error: the caller moves on to the next candidate.

use chrono::{DateTime, Utc};

use super::error::EnrichmentError;
use super::state_machine::RetryPolicy;
use crate::db::dataset_repo::{self, DatasetRow};
use crate::db::Database;

/// Result of trying to take ownership of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This worker now owns the record, which is `enriching`.
    Claimed(DatasetRow),
    /// Nothing changed. Someone else owns it, or it is not claimable.
    Conflict,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }

    /// Converts a lost claim into [`EnrichmentError::ClaimConflict`].
    pub fn claimed(self, dataset_id: &str) -> Result<DatasetRow, EnrichmentError> {
        match self {
            ClaimOutcome::Claimed(row) => Ok(row),
            ClaimOutcome::Conflict => Err(EnrichmentError::ClaimConflict(dataset_id.to_string())),
        }
    }
}

/// Claims `dataset_id` for this worker.
///
/// Succeeds only if, at the instant of the write, the record is active, in
/// `minimal`, `pending` or `failed`, and below the attempt budget. On success
/// `last_checked_at` is set to `now`.
pub fn claim(
    db: &Database,
    dataset_id: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome, EnrichmentError> {
    let row = db.with_conn(|conn| {
        dataset_repo::mark_enriching(conn, dataset_id, policy.max_attempts, now)
    })?;

    Ok(match row {
        Some(row) => {
            log::debug!("Claimed dataset {}", dataset_id);
            ClaimOutcome::Claimed(row)
        }
        None => {
            log::debug!("Claim conflict on dataset {}", dataset_id);
            ClaimOutcome::Conflict
        }
    })
}
