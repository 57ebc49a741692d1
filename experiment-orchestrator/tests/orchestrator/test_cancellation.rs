//! Cancellation and timeouts

use super::common::*;
use experiment_orchestrator::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn cancel_after(token: &CancellationToken, delay: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}

#[tokio::test]
async fn test_abort_cancels_running_and_leaves_rest_pending() {
    let harness = Harness::new(ScriptedWorker::new(Behavior::Hang));
    let experiment = numbered("aborted", 4, 2);

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(200));

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        harness
            .orchestrator()
            .run(&experiment, RunOptions::default(), cancel),
    )
    .await
    .expect("run should return promptly after cancel")
    .unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.aggregate.cancelled_variants(), vec!["v1", "v2"]);
    assert_eq!(report.aggregate.pending, 2);
    assert!(!report.aggregate.is_complete());

    let stored = harness.store.load("aborted").await.unwrap().unwrap();
    assert_eq!(stored.state, ExperimentState::InProgress);
    assert_eq!(stored.variant("v3").unwrap().status, VariantStatus::Pending);
}

#[tokio::test]
async fn test_abort_after_every_variant_started_is_still_aborted() {
    let harness = Harness::new(ScriptedWorker::new(Behavior::Hang));
    // More slots than variants: nothing is left in the queue when the token fires
    let experiment = numbered("all-started", 3, 5);

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(200));
    let report = harness
        .orchestrator()
        .run(&experiment, RunOptions::default(), cancel)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.aggregate.cancelled_variants(), vec!["v1", "v2", "v3"]);

    let stored = harness.store.load("all-started").await.unwrap().unwrap();
    assert_eq!(stored.state, ExperimentState::InProgress);
}

#[tokio::test]
async fn test_completed_results_survive_abort_and_resume() {
    let harness = Harness::new(
        ScriptedWorker::new(Behavior::Hang).with("v1", Behavior::Succeed),
    );
    let experiment = numbered("partial", 3, 3);

    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(200));
    let report = harness
        .orchestrator()
        .run(&experiment, RunOptions::default(), cancel)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.aggregate.succeeded_variants(), vec!["v1"]);
    assert_eq!(report.aggregate.cancelled_variants(), vec!["v2", "v3"]);

    // Cancelled variants are skipped unless asked for
    let idle = Arc::new(ScriptedWorker::succeeding());
    harness
        .orchestrator_with(idle.clone())
        .run(&experiment, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert!(idle.calls().is_empty());

    let worker = Arc::new(ScriptedWorker::succeeding());
    let report = harness
        .orchestrator_with(worker.clone())
        .run(
            &experiment,
            RunOptions::default().retry_cancelled(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut calls = worker.calls();
    calls.sort();
    assert_eq!(calls, vec!["v2", "v3"]);
    assert_eq!(report.status, RunStatus::AllSucceeded);
}

#[tokio::test]
async fn test_cancel_before_start_runs_nothing() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = harness
        .orchestrator()
        .run(&cache_layer(), RunOptions::default(), cancel)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.aggregate.pending, 3);
    assert!(harness.worker.calls().is_empty());
    assert!(harness.provisioner.provisioned().is_empty());
}

#[tokio::test]
async fn test_timeout_is_recorded_as_cancelled() {
    let mut harness = Harness::new(ScriptedWorker::succeeding().with("redis", Behavior::Hang));
    harness.config.variant_timeout_secs = 1;

    let report = harness
        .orchestrator()
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.aggregate.cancelled_variants(), vec!["redis"]);
    assert_eq!(report.aggregate.succeeded, 2);
    // A timeout is not a caller abort
    assert_eq!(report.status, RunStatus::PartialFailure);

    let redis = report.aggregate.items[1].outcome.as_ref().unwrap();
    assert!(redis.summary.contains("timed out after 1s"));
    assert!(redis.error.is_none());
}
