//! Failure isolation between variants

use super::common::*;
use experiment_orchestrator::*;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_provision_failure_is_reported_not_fatal() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let provisioner = TempProvisioner::new(harness.workspace_root()).failing("redis");
    let harness = harness.with_provisioner(provisioner);

    let report = harness
        .orchestrator()
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::PartialFailure);
    assert_eq!(report.aggregate.failed_variants(), vec!["redis"]);
    assert_eq!(report.aggregate.succeeded_variants(), vec!["in-memory", "hybrid"]);

    // The worker never saw the variant whose workspace could not be created
    assert!(!harness.worker.calls().contains(&"redis".to_string()));

    let redis = &report.aggregate.items[1];
    assert!(redis.workspace.is_none());
    let error = redis.outcome.as_ref().unwrap().error.clone().unwrap();
    assert!(error.contains("simulated worktree failure"), "{}", error);
}

#[tokio::test]
async fn test_panicking_worker_does_not_take_down_siblings() {
    let harness = Harness::new(ScriptedWorker::succeeding().with("hybrid", Behavior::Panic));

    let report = harness
        .orchestrator()
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.aggregate.failed_variants(), vec!["hybrid"]);
    assert_eq!(report.aggregate.succeeded_variants(), vec!["in-memory", "redis"]);
    let error = report.aggregate.items[2]
        .outcome
        .as_ref()
        .unwrap()
        .error
        .clone()
        .unwrap();
    assert!(error.contains("panicked"), "{}", error);
}

#[tokio::test]
async fn test_every_variant_gets_its_own_workspace() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let experiment = numbered("isolated", 4, 4);

    let report = harness
        .orchestrator()
        .run(&experiment, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    let workspaces: HashSet<_> = report
        .aggregate
        .items
        .iter()
        .map(|item| item.workspace.clone().unwrap())
        .collect();
    assert_eq!(workspaces.len(), 4);

    for item in &report.aggregate.items {
        let workspace = item.workspace.as_ref().unwrap();
        let written = std::fs::read_to_string(workspace.join("variant.txt")).unwrap();
        assert_eq!(written, item.variant);
    }
}

#[tokio::test]
async fn test_non_ascii_variant_names_get_distinct_workspaces() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let experiment = Experiment::new("unicode", "task")
        .variant("缓存", "cache")
        .variant("🚀", "rocket")
        .variant("redis", "redis")
        .max_parallel(3);

    let report = harness
        .orchestrator()
        .run(&experiment, RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::AllSucceeded);

    let experiment_root = harness.workspace_root().join("unicode");
    let workspaces: HashSet<_> = report
        .aggregate
        .items
        .iter()
        .map(|item| item.workspace.clone().unwrap())
        .collect();
    assert_eq!(workspaces.len(), 3);
    assert!(workspaces
        .iter()
        .all(|w| w.parent() == Some(experiment_root.as_path())));
}

#[tokio::test]
async fn test_workspaces_survive_the_run_until_cleanup() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let orchestrator = harness.orchestrator();
    let report = orchestrator
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    for item in &report.aggregate.items {
        assert!(item.workspace.as_ref().unwrap().exists());
    }

    let cleanup = orchestrator.cleanup("cache-layer", None).await.unwrap();
    assert_eq!(cleanup.destroyed, vec!["in-memory", "redis", "hybrid"]);
    assert!(cleanup.failed.is_empty());
    for item in &report.aggregate.items {
        assert!(!item.workspace.as_ref().unwrap().exists());
    }

    // Results stay inspectable after cleanup
    let status = orchestrator.status("cache-layer").await.unwrap().unwrap();
    assert_eq!(status.succeeded, 3);
    assert!(status.items.iter().all(|item| item.workspace.is_none()));

    // Nothing left to clean
    let again = orchestrator.cleanup("cache-layer", None).await.unwrap();
    assert!(again.destroyed.is_empty());
    assert_eq!(again.skipped.len(), 3);
}
