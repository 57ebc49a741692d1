//! Resume, retry and idempotence

use super::common::*;
use experiment_orchestrator::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_second_run_is_pure_aggregation() {
    let harness = Harness::new(
        ScriptedWorker::succeeding().with("redis", Behavior::Fail("redis connection refused")),
    );
    let orchestrator = harness.orchestrator();

    let first = orchestrator
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    let provisioned = harness.provisioner.provisioned().len();
    let calls = harness.worker.calls().len();

    let second = orchestrator
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(harness.provisioner.provisioned().len(), provisioned);
    assert_eq!(harness.worker.calls().len(), calls);
    assert_eq!(second.aggregate, first.aggregate);
    assert_eq!(second.status, first.status);
    assert_ne!(second.run_id, first.run_id);
}

#[tokio::test]
async fn test_resume_runs_only_unfinished_variants() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let experiment = numbered("resume", 5, 2);

    // Two variants finished before the crash
    let mut record = ProgressRecord::new(experiment.clone());
    for name in ["v2", "v4"] {
        record
            .variant_mut(name)
            .unwrap()
            .finish(Outcome::succeeded(WorkerOutput::new("earlier"), 10));
    }
    record.state = ExperimentState::InProgress;
    harness.store.save(&record).await.unwrap();

    let report = harness
        .orchestrator()
        .run(&experiment, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    let mut calls = harness.worker.calls();
    calls.sort();
    assert_eq!(calls, vec!["v1", "v3", "v5"]);
    assert_eq!(harness.provisioner.provisioned().len(), 3);
    assert_eq!(report.status, RunStatus::AllSucceeded);

    // Earlier outcomes are kept as recorded
    let v2 = report.aggregate.items[1].outcome.as_ref().unwrap();
    assert_eq!(v2.summary, "earlier");
}

#[tokio::test]
async fn test_interrupted_variant_reuses_its_workspace() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let experiment = cache_layer();

    let workspace = harness.provisioner.path_for("cache-layer", "redis");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::write(workspace.join("partial.rs"), "// half done").unwrap();

    let mut record = ProgressRecord::new(experiment.clone());
    for name in ["in-memory", "hybrid"] {
        record
            .variant_mut(name)
            .unwrap()
            .finish(Outcome::succeeded(WorkerOutput::new("done"), 10));
    }
    record.variant_mut("redis").unwrap().mark_running(workspace.clone());
    harness.store.save(&record).await.unwrap();

    let report = harness
        .orchestrator()
        .run(&experiment, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(harness.worker.calls(), vec!["redis"]);
    assert!(harness.provisioner.provisioned().is_empty());
    assert!(workspace.join("partial.rs").exists());
    assert_eq!(report.status, RunStatus::AllSucceeded);

    let stored = harness.store.load("cache-layer").await.unwrap().unwrap();
    let redis = stored.variant("redis").unwrap();
    assert_eq!(redis.attempts, 2);
    assert_eq!(redis.workspace_path.as_ref(), Some(&workspace));
    assert_eq!(stored.state, ExperimentState::Completed);
}

#[tokio::test]
async fn test_interrupted_workspace_replaced_when_reuse_disabled() {
    let mut harness = Harness::new(ScriptedWorker::succeeding());
    harness.config.reuse_interrupted_workspaces = false;
    let experiment = cache_layer();

    let workspace = harness.provisioner.path_for("cache-layer", "redis");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::write(workspace.join("partial.rs"), "// half done").unwrap();

    let mut record = ProgressRecord::new(experiment.clone());
    record.variant_mut("redis").unwrap().mark_running(workspace.clone());
    harness.store.save(&record).await.unwrap();

    harness
        .orchestrator()
        .run(&experiment, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(harness.provisioner.destroyed(), vec![workspace.clone()]);
    assert!(harness
        .provisioner
        .provisioned()
        .contains(&"redis".to_string()));
    assert!(!workspace.join("partial.rs").exists());
}

#[tokio::test]
async fn test_uninspectable_workspace_fails_instead_of_reprovisioning() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let experiment = cache_layer();

    // A path below a regular file cannot be stat'ed
    let blocker = harness.dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let workspace = blocker.join("redis");

    let mut record = ProgressRecord::new(experiment.clone());
    record.variant_mut("redis").unwrap().mark_running(workspace.clone());
    harness.store.save(&record).await.unwrap();

    let report = harness
        .orchestrator()
        .run(&experiment, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::PartialFailure);
    assert_eq!(report.aggregate.failed_variants(), vec!["redis"]);
    let error = report.aggregate.items[1]
        .outcome
        .as_ref()
        .unwrap()
        .error
        .clone()
        .unwrap();
    assert!(error.contains("cannot inspect workspace"), "{}", error);

    assert!(!harness
        .provisioner
        .provisioned()
        .contains(&"redis".to_string()));
    assert!(!harness.worker.calls().contains(&"redis".to_string()));
}

#[tokio::test]
async fn test_retry_named_variant() {
    let harness = Harness::new(
        ScriptedWorker::succeeding().with("redis", Behavior::Fail("redis connection refused")),
    );
    harness
        .orchestrator()
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    // The fix landed; retry only the failed variant
    let fixed = Arc::new(ScriptedWorker::succeeding());
    let report = harness
        .orchestrator_with(fixed.clone())
        .run(
            &cache_layer(),
            RunOptions::default().retry(["redis"]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(fixed.calls(), vec!["redis"]);
    assert_eq!(report.status, RunStatus::AllSucceeded);
}

#[tokio::test]
async fn test_retry_unknown_variant_is_rejected() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let err = harness
        .orchestrator()
        .run(
            &cache_layer(),
            RunOptions::default().retry(["memcached"]),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownVariant { .. }));
    assert!(harness.worker.calls().is_empty());
}

#[tokio::test]
async fn test_progress_survives_a_new_process() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    harness
        .orchestrator()
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    // A fresh store over the same directory sees everything
    let reopened = Arc::new(JsonProgressStore::new(&harness.config.state_dir));
    let worker = Arc::new(ScriptedWorker::succeeding());
    let orchestrator = Orchestrator::new(
        harness.config.clone(),
        reopened,
        harness.provisioner.clone(),
        worker.clone(),
    );
    let report = orchestrator
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert!(worker.calls().is_empty());
    assert_eq!(report.status, RunStatus::AllSucceeded);
}
