//! End-to-end lifecycle of dataset records through the state machine.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;

use common::{succeeding_registry, t0, DatasetBuilder, ScriptedExecutor, TestHarness};
use datasearch::db::dataset_repo;
use datasearch::enrichment::{
    claim, reactivate, record_outcome, requeue_stale, EnrichmentError, EnrichmentResult,
    EnrichmentStage, EnrichmentStatus, ExecutorRegistry, RetryMode, RetryPolicy, StageOutcome,
    StagePlan, StageReport, ATTEMPTS_EXHAUSTED,
};

fn policy(max_attempts: u32, on_failure: RetryMode, on_rate_limit: RetryMode) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        on_failure,
        on_rate_limit,
    }
}

#[test]
fn resync_overwrites_metadata_but_not_envelope() {
    let harness = TestHarness::new();
    let first = dataset_repo::upsert(
        &harness.db,
        &DatasetBuilder::new("kaggle", "noaa/weather")
            .title("Weather")
            .downloads(10)
            .build(),
        t0(),
    )
    .unwrap();

    let policy = RetryPolicy::default();
    claim(&harness.db, &first.id, &policy, t0()).unwrap();
    let mut report = StageReport::new(&first.id, EnrichmentStage::ApiMetadata, EnrichmentResult::Failed);
    report.error_message = Some("timeout".to_string());
    record_outcome(&harness.db, &report, &StagePlan::default(), &policy, t0()).unwrap();
    let enriched_once = harness.dataset(&first.id);

    let second = dataset_repo::upsert(
        &harness.db,
        &DatasetBuilder::new("kaggle", "noaa/weather")
            .title("Weather (2026 refresh)")
            .downloads(250)
            .tags(&["climate"])
            .build(),
        t0() + Duration::days(1),
    )
    .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.title, "Weather (2026 refresh)");
    assert_eq!(second.download_count, 250);
    assert_eq!(second.tags, Some(vec!["climate".to_string()]));
    assert_eq!(second.enrichment_status, enriched_once.enrichment_status);
    assert_eq!(second.enrichment_attempts, enriched_once.enrichment_attempts);
    assert_eq!(second.last_enrichment_error, enriched_once.last_enrichment_error);
    assert_eq!(second.current_stage, enriched_once.current_stage);
    assert_eq!(second.last_checked_at, enriched_once.last_checked_at);
}

#[test]
fn failed_record_with_attempts_left_is_pending_work() {
    let harness = TestHarness::new();
    let id = harness.seed("kaggle", 1).remove(0).id;
    let plan = StagePlan::new(vec![EnrichmentStage::ApiMetadata]).unwrap();
    let pol = policy(3, RetryMode::Park, RetryMode::Park);

    for _ in 0..2 {
        claim(&harness.db, &id, &pol, t0()).unwrap().claimed(&id).unwrap();
        let report = StageReport::new(&id, EnrichmentStage::ApiMetadata, EnrichmentResult::Failed);
        record_outcome(&harness.db, &report, &plan, &pol, t0()).unwrap();
    }

    let row = harness.dataset(&id);
    assert_eq!(row.enrichment_status, EnrichmentStatus::Failed);
    assert_eq!(row.enrichment_attempts, 2);

    let with_three = dataset_repo::pending_for_enrichment(&harness.db, "kaggle", 10, 3).unwrap();
    assert_eq!(with_three.len(), 1);
    let with_two = dataset_repo::pending_for_enrichment(&harness.db, "kaggle", 10, 2).unwrap();
    assert!(with_two.is_empty());
}

#[test]
fn rate_limited_first_attempt_parks_or_requeues() {
    for (mode, expected) in [
        (RetryMode::Park, EnrichmentStatus::Failed),
        (RetryMode::Requeue, EnrichmentStatus::Pending),
    ] {
        let harness = TestHarness::new();
        let id = harness.seed("huggingface", 1).remove(0).id;
        let pol = policy(3, RetryMode::Park, mode);

        claim(&harness.db, &id, &pol, t0()).unwrap().claimed(&id).unwrap();
        let mut report =
            StageReport::new(&id, EnrichmentStage::ApiMetadata, EnrichmentResult::RateLimited);
        report.error_message = Some("429 Too Many Requests".to_string());
        report.error_type = Some("http_429".to_string());
        record_outcome(&harness.db, &report, &StagePlan::default(), &pol, t0()).unwrap();

        let row = harness.dataset(&id);
        assert_eq!(row.enrichment_status, expected, "mode {mode:?}");
        assert_eq!(row.enrichment_attempts, 1);
        assert_eq!(
            row.last_enrichment_error.as_deref(),
            Some("429 Too Many Requests")
        );

        let logs = harness.logs(&id);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].result, EnrichmentResult::RateLimited);
        assert_eq!(logs[0].attempt_number, 1);
    }
}

#[test]
fn attempts_only_grow_and_every_exit_logs_once() {
    let harness = TestHarness::new();
    let id = harness.seed("kaggle", 1).remove(0).id;
    let pol = policy(10, RetryMode::Requeue, RetryMode::Requeue);

    let metadata = ScriptedExecutor::new(
        EnrichmentStage::ApiMetadata,
        vec![
            StageOutcome::rate_limited("slow down"),
            StageOutcome::failed("http_500", "server error"),
        ],
        StageOutcome::success(),
    );
    let registry = Arc::new(
        succeeding_registry().with(metadata),
    );
    let runner = harness.runner(registry, StagePlan::default(), pol, "worker-a");

    let mut last_attempts = 0;
    let mut exits = 0;
    for _ in 0..10 {
        let report = runner.run_pass("kaggle").unwrap();
        if report.is_idle() {
            break;
        }
        exits += report.claimed;
        let row = harness.dataset(&id);
        assert!(row.enrichment_attempts >= last_attempts);
        last_attempts = row.enrichment_attempts;
    }

    let row = harness.dataset(&id);
    assert_eq!(row.enrichment_status, EnrichmentStatus::Enriched);
    // two metadata failures, then four successful stages
    assert_eq!(row.enrichment_attempts, 6);
    assert_eq!(exits, 6);

    let logs = harness.logs(&id);
    assert_eq!(logs.len(), 6);
    let keys: HashSet<_> = logs
        .iter()
        .map(|l| (l.dataset_id.clone(), l.stage, l.attempt_number))
        .collect();
    assert_eq!(keys.len(), logs.len());
}

#[test]
fn failed_log_write_rolls_back_status_change() {
    let harness = TestHarness::new();
    let id = harness.seed("kaggle", 1).remove(0).id;
    let pol = RetryPolicy::default();
    claim(&harness.db, &id, &pol, t0()).unwrap().claimed(&id).unwrap();

    harness
        .db
        .with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_logs BEFORE INSERT ON dataset_enrichment_logs
                 BEGIN SELECT RAISE(ABORT, 'log volume unavailable'); END;",
            )?;
            Ok(())
        })
        .unwrap();

    let mut report = StageReport::new(&id, EnrichmentStage::ApiMetadata, EnrichmentResult::Success);
    report.artifacts.static_score = Some(0.3);
    let err = record_outcome(&harness.db, &report, &StagePlan::default(), &pol, t0()).unwrap_err();
    assert!(matches!(err, EnrichmentError::Database(_)));

    let row = harness.dataset(&id);
    assert_eq!(row.enrichment_status, EnrichmentStatus::Enriching);
    assert_eq!(row.enrichment_attempts, 0);
    assert!(row.current_stage.is_none());
    assert!(row.static_score.is_none());
    assert!(harness.logs(&id).is_empty());
}

#[test]
fn exhausted_record_waits_for_reactivation() {
    let harness = TestHarness::new();
    let id = harness.seed("kaggle", 1).remove(0).id;
    let pol = policy(4, RetryMode::Requeue, RetryMode::Requeue);
    let registry = Arc::new(ExecutorRegistry::new().with(ScriptedExecutor::new(
        EnrichmentStage::ApiMetadata,
        vec![],
        StageOutcome::failed("parse_error", "bad payload"),
    )));
    let plan = StagePlan::new(vec![EnrichmentStage::ApiMetadata]).unwrap();
    let runner = harness.runner(registry, plan, pol, "worker-a");

    for _ in 0..4 {
        assert_eq!(runner.run_pass("kaggle").unwrap().failed, 1);
    }
    assert!(runner.run_pass("kaggle").unwrap().is_idle());

    let row = harness.dataset(&id);
    assert_eq!(row.enrichment_status, EnrichmentStatus::Failed);
    assert_eq!(row.enrichment_attempts, 4);

    reactivate(&harness.db, &id, t0()).unwrap();
    assert_eq!(runner.run_pass("kaggle").unwrap().claimed, 1);
}

#[test]
fn skipped_record_never_competes_again() {
    let harness = TestHarness::new();
    let id = harness.seed("kaggle", 1).remove(0).id;
    let pol = RetryPolicy::default();
    let plan = StagePlan::default();

    claim(&harness.db, &id, &pol, t0()).unwrap().claimed(&id).unwrap();
    let report = StageReport::new(&id, EnrichmentStage::ApiMetadata, EnrichmentResult::Skipped);
    record_outcome(&harness.db, &report, &plan, &pol, t0()).unwrap();

    assert_eq!(harness.dataset(&id).enrichment_status, EnrichmentStatus::Skipped);
    assert!(!claim(&harness.db, &id, &pol, t0()).unwrap().is_claimed());
    assert!(dataset_repo::pending_for_enrichment(&harness.db, "kaggle", 10, 6)
        .unwrap()
        .is_empty());
}

#[test]
fn crashed_worker_claim_is_reaped_and_resumed() {
    let harness = TestHarness::new();
    let id = harness.seed("kaggle", 1).remove(0).id;
    let pol = RetryPolicy::default();
    let plan = StagePlan::default();

    // Worker claims and dies without reporting.
    claim(&harness.db, &id, &pol, t0()).unwrap().claimed(&id).unwrap();

    let reaped = requeue_stale(&harness.db, &plan, &pol, Duration::minutes(30), t0() + Duration::hours(2))
        .unwrap();
    assert_eq!(reaped.requeued, 1);

    let row = harness.dataset(&id);
    assert_eq!(row.enrichment_status, EnrichmentStatus::Pending);
    assert_eq!(row.enrichment_attempts, 1);
    let logs = harness.logs(&id);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].error_type.as_deref(), Some("claim_expired"));

    let runner = harness.runner(Arc::new(succeeding_registry()), plan, pol, "worker-b");
    assert_eq!(runner.run_pass("kaggle").unwrap().succeeded, 1);
}

#[test]
fn budget_spent_before_last_stage_fails_with_error() {
    let harness = TestHarness::new();
    let id = harness.seed("kaggle", 1).remove(0).id;
    let pol = policy(2, RetryMode::Requeue, RetryMode::Requeue);
    let plan = StagePlan::new(vec![EnrichmentStage::ApiMetadata, EnrichmentStage::StaticScore])
        .unwrap();
    let registry = Arc::new(
        ExecutorRegistry::new()
            .with(ScriptedExecutor::new(
                EnrichmentStage::ApiMetadata,
                vec![StageOutcome::failed("timeout", "upstream slow")],
                StageOutcome::success(),
            ))
            .with(ScriptedExecutor::new(
                EnrichmentStage::StaticScore,
                vec![],
                StageOutcome::success().with_static_score(1.0),
            )),
    );
    let runner = harness.runner(registry, plan, pol, "worker-a");

    assert_eq!(runner.run_pass("kaggle").unwrap().failed, 1);
    assert_eq!(runner.run_pass("kaggle").unwrap().succeeded, 1);

    let row = harness.dataset(&id);
    assert_eq!(row.enrichment_status, EnrichmentStatus::Failed);
    assert_eq!(row.enrichment_attempts, 2);
    assert_eq!(row.current_stage, Some(EnrichmentStage::StaticScore));
    assert_eq!(row.last_enrichment_error.as_deref(), Some(ATTEMPTS_EXHAUSTED));
    assert!(row.static_score.is_none());

    let logs = harness.logs(&id);
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].result, EnrichmentResult::Success);

    assert!(runner.run_pass("kaggle").unwrap().is_idle());
    assert!(dataset_repo::pending_for_enrichment(&harness.db, "kaggle", 10, pol.max_attempts)
        .unwrap()
        .is_empty());

    reactivate(&harness.db, &id, t0()).unwrap();
    assert_eq!(runner.run_pass("kaggle").unwrap().succeeded, 1);
    let report = runner.run_pass("kaggle").unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(harness.dataset(&id).enrichment_status, EnrichmentStatus::Enriched);
}

#[test]
fn plan_change_between_passes_releases_orphaned_records() {
    let harness = TestHarness::new();
    let advanced: Vec<String> = harness.seed("kaggle", 2).into_iter().map(|d| d.id).collect();
    let registry = Arc::new(succeeding_registry());
    let pol = RetryPolicy::default();

    let before = harness.runner(registry.clone(), StagePlan::default(), pol, "worker-a");
    assert_eq!(before.run_pass("kaggle").unwrap().succeeded, 2);
    for id in &advanced {
        assert_eq!(harness.dataset(id).current_stage, Some(EnrichmentStage::Embedding));
    }

    let fresh = dataset_repo::upsert(
        &harness.db,
        &DatasetBuilder::new("kaggle", "fresh/arrival").build(),
        t0(),
    )
    .unwrap();

    let trimmed = StagePlan::new(vec![EnrichmentStage::ApiMetadata, EnrichmentStage::StaticScore])
        .unwrap();
    let after = harness.runner(registry, trimmed, pol, "worker-b");
    let report = after.run_pass("kaggle").unwrap();
    assert_eq!(report.claimed, 3);
    assert_eq!(report.errors, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(report.succeeded, 1);

    assert_eq!(
        harness.dataset(&fresh.id).current_stage,
        Some(EnrichmentStage::StaticScore)
    );
    for id in &advanced {
        let row = harness.dataset(id);
        assert_eq!(row.enrichment_status, EnrichmentStatus::Failed);
        assert_eq!(row.enrichment_attempts, 2);
        let logs = harness.logs(id);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].stage, EnrichmentStage::Embedding);
        assert_eq!(logs[0].error_type.as_deref(), Some("stage_not_in_plan"));
    }
    assert_eq!(
        dataset_repo::count_by_status(&harness.db, "kaggle", EnrichmentStatus::Enriching).unwrap(),
        0
    );

    // Reactivation restarts them at the head of the new plan.
    for id in &advanced {
        reactivate(&harness.db, id, t0()).unwrap();
    }
    let report = after.run_pass("kaggle").unwrap();
    assert_eq!(report.errors, 0);
    assert_eq!(report.completed, 1);
    assert_eq!(report.succeeded, 3);
}

#[test]
fn reaper_releases_claims_left_on_dropped_stage() {
    let harness = TestHarness::new();
    let ids: Vec<String> = harness.seed("kaggle", 2).into_iter().map(|d| d.id).collect();
    let pol = RetryPolicy::default();
    let before = harness.runner(Arc::new(succeeding_registry()), StagePlan::default(), pol, "worker-a");
    assert_eq!(before.run_pass("kaggle").unwrap().succeeded, 2);

    // Both workers die mid-embedding; one record also refuses log writes.
    for id in &ids {
        claim(&harness.db, id, &pol, t0()).unwrap().claimed(id).unwrap();
    }
    harness
        .db
        .with_conn(|conn| {
            conn.execute_batch(&format!(
                "CREATE TRIGGER refuse_logs BEFORE INSERT ON dataset_enrichment_logs
                 WHEN NEW.dataset_id = '{}'
                 BEGIN SELECT RAISE(ABORT, 'log write refused'); END;",
                ids[1]
            ))?;
            Ok(())
        })
        .unwrap();

    let trimmed = StagePlan::new(vec![EnrichmentStage::ApiMetadata, EnrichmentStage::StaticScore])
        .unwrap();
    let reaped = requeue_stale(&harness.db, &trimmed, &pol, Duration::minutes(30), t0() + Duration::hours(2))
        .unwrap();
    assert_eq!(reaped.scanned, 2);
    assert_eq!(reaped.requeued, 1);
    assert_eq!(reaped.errors, 1);

    let released = harness.dataset(&ids[0]);
    assert_eq!(released.enrichment_status, EnrichmentStatus::Pending);
    assert_eq!(released.current_stage, Some(EnrichmentStage::Embedding));
    let logs = harness.logs(&ids[0]);
    assert_eq!(logs[0].stage, EnrichmentStage::Embedding);
    assert_eq!(logs[0].error_type.as_deref(), Some("claim_expired"));

    assert_eq!(harness.dataset(&ids[1]).enrichment_status, EnrichmentStatus::Enriching);

    harness
        .db
        .with_conn(|conn| {
            conn.execute_batch("DROP TRIGGER refuse_logs;")?;
            Ok(())
        })
        .unwrap();
    let retried = requeue_stale(&harness.db, &trimmed, &pol, Duration::minutes(30), t0() + Duration::hours(3))
        .unwrap();
    assert_eq!(retried.requeued, 1);
    assert_eq!(retried.errors, 0);
    assert_eq!(harness.dataset(&ids[1]).enrichment_status, EnrichmentStatus::Pending);
}
