//! The cache-layer experiment end to end

use super::common::*;
use experiment_orchestrator::*;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_cache_layer_with_one_failure() {
    let harness = Harness::new(
        ScriptedWorker::succeeding().with("redis", Behavior::Fail("redis connection refused")),
    );
    let orchestrator = harness.orchestrator();

    let report = orchestrator
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    let aggregate = &report.aggregate;
    assert_eq!(aggregate.succeeded_variants(), vec!["in-memory", "hybrid"]);
    assert_eq!(aggregate.failed_variants(), vec!["redis"]);
    assert!(aggregate.cancelled_variants().is_empty());
    assert_eq!(report.status, RunStatus::PartialFailure);

    let redis = &aggregate.items[1];
    assert_eq!(redis.variant, "redis");
    let outcome = redis.outcome.as_ref().unwrap();
    assert_eq!(outcome.error.as_deref(), Some("redis connection refused"));
    assert!(redis.summary.contains("redis connection refused"));

    let table = aggregate.render_text();
    for name in ["in-memory", "redis", "hybrid"] {
        assert!(table.contains(name), "{}", table);
    }
}

#[tokio::test]
async fn test_all_succeeded_and_all_failed() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let report = harness
        .orchestrator()
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::AllSucceeded);
    assert_eq!(report.aggregate.succeeded, 3);

    let harness = Harness::new(ScriptedWorker::new(Behavior::Fail("nope")));
    let report = harness
        .orchestrator()
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::AllFailed);
    assert_eq!(report.aggregate.failed, 3);
}

#[tokio::test]
async fn test_worker_receives_task_and_instructions() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let report = harness
        .orchestrator()
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    let hybrid = report.aggregate.items[2].outcome.as_ref().unwrap();
    assert_eq!(hybrid.summary, "hybrid implemented");
    assert_eq!(
        hybrid.metrics["instructions_len"],
        "L1 in memory, L2 redis".len() as u64
    );
}

#[tokio::test]
async fn test_events_bracket_the_run() {
    let harness = Harness::new(ScriptedWorker::succeeding());
    let orchestrator = harness.orchestrator();
    let mut events = orchestrator.subscribe();

    let report = orchestrator
        .run(&cache_layer(), RunOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }

    assert!(matches!(
        received.first(),
        Some(ExperimentEvent::RunStarted { pending: 3, total: 3, .. })
    ));
    match received.last() {
        Some(ExperimentEvent::RunFinished { run_id, status, .. }) => {
            assert_eq!(*run_id, report.run_id);
            assert_eq!(*status, RunStatus::AllSucceeded);
        }
        other => panic!("unexpected last event {:?}", other),
    }

    let finished = received
        .iter()
        .filter(|e| matches!(e, ExperimentEvent::VariantFinished { .. }))
        .count();
    assert_eq!(finished, 3);
}
