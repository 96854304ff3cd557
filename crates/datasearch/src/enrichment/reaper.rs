//! Stale-claim reaper.
//!
//! A worker that dies mid-stage leaves its record in `enriching`. The reaper
//! finds claims whose `last_checked_at` is older than the timeout and
//! releases them through the state machine, one transaction per record.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::error::EnrichmentError;
use super::state_machine::{RetryPolicy, StagePlan};
use super::status::EnrichmentStatus;
use super::transition::release_expired;
use crate::db::dataset_repo;
use crate::db::Database;

/// Upper bound on records released per call.
pub const REAP_BATCH_SIZE: u32 = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    pub scanned: usize,
    /// Released back to `pending`.
    pub requeued: usize,
    /// Out of attempts, now `failed`.
    pub exhausted: usize,
    /// Could not be released on this call; retried on the next one.
    pub errors: usize,
}

impl ReapReport {
    pub fn released(&self) -> usize {
        self.requeued + self.exhausted
    }
}

/// Releases every claim older than `stale_after`.
///
/// A record that fails to release is logged and counted in
/// [`ReapReport::errors`]; the rest of the batch is still released.
pub fn requeue_stale(
    db: &Database,
    plan: &StagePlan,
    policy: &RetryPolicy,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> Result<ReapReport, EnrichmentError> {
    let cutoff = now - stale_after;
    let ids = db.with_conn(|conn| dataset_repo::find_stale_enriching(conn, cutoff, REAP_BATCH_SIZE))?;

    let mut report = ReapReport {
        scanned: ids.len(),
        ..Default::default()
    };

    for id in ids {
        let recorded = match release_expired(db, &id, plan, policy, cutoff, now) {
            Ok(Some(recorded)) => recorded,
            Ok(None) => continue,
            Err(e) => {
                log::error!("Failed to release stale claim on dataset {}: {}", id, e);
                report.errors += 1;
                continue;
            }
        };
        match recorded.dataset.enrichment_status {
            EnrichmentStatus::Pending => report.requeued += 1,
            _ => report.exhausted += 1,
        }
        log::warn!(
            "Released stale claim on dataset {} (attempt {}, now {})",
            id,
            recorded.log.attempt_number,
            recorded.dataset.enrichment_status
        );
    }

    if report.released() > 0 || report.errors > 0 {
        log::info!(
            "Reaper released {} stale claims ({} requeued, {} exhausted, {} errors)",
            report.released(),
            report.requeued,
            report.exhausted,
            report.errors
        );
    }
    Ok(report)
}
