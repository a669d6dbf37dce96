//! Failure handling: retry budgets, conflicts, rejections and store outages.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p steward-e2e --test failures
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use steward_id::{Generation, ResourceKey, ResourceKind, ResourceVersion};
use steward_reconcile::{
    BackoffPolicy, ClusterError, DesiredStateStore, MemoryCluster, MemoryDesiredStore,
    Ownership, ProcessCondition, ReconcileError, ReconciliationStatus, Reconciler,
    ReconcilerConfig, RetryPolicy, TaskOutcome,
};
use steward_testing::{init_tracing, FlakyCluster, ToggleStore};

fn web() -> ResourceKey {
    ResourceKey::new(ResourceKind::Deployment, "default", "web").unwrap()
}

fn config(max_attempts: u32, max_conflicts: u32) -> ReconcilerConfig {
    ReconcilerConfig {
        retry: RetryPolicy {
            max_attempts,
            max_conflicts,
            backoff: BackoffPolicy::immediate(),
        },
        ..ReconcilerConfig::default()
    }
}

fn unavailable() -> ClusterError {
    ClusterError::Unavailable("connection refused".to_string())
}

#[tokio::test]
async fn test_transient_failures_stop_at_exactly_max_attempts() {
    init_tracing();
    let store = Arc::new(MemoryDesiredStore::new());
    let cluster = Arc::new(FlakyCluster::new(Arc::new(MemoryCluster::new())));
    cluster.fail_applies(10, unavailable()).await;
    store.declare(&web(), json!({"spec": {"replicas": 3}})).await;

    let reconciler = Reconciler::new(config(3, 2), store, cluster.clone());
    reconciler.full_resync().await.unwrap();
    let outcomes = reconciler.run_until_idle().await;

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], TaskOutcome::Retrying { attempts: 1, .. }));
    assert!(matches!(outcomes[1], TaskOutcome::Retrying { attempts: 2, .. }));
    assert!(matches!(
        &outcomes[2],
        TaskOutcome::Failed(ReconcileError::RetryBudgetExhausted { attempts: 3, .. })
    ));
    assert_eq!(cluster.apply_calls().await, 3);

    let status = reconciler.status().get(&web()).await.unwrap();
    assert_eq!(status.status, ReconciliationStatus::Error);
    assert_eq!(status.attempts, 3);
    assert!(status.message.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_degraded_between_attempts_then_recovers() {
    let store = Arc::new(MemoryDesiredStore::new());
    let cluster = Arc::new(FlakyCluster::new(Arc::new(MemoryCluster::new())));
    cluster.fail_applies(1, unavailable()).await;
    store.declare(&web(), json!({"spec": {"replicas": 3}})).await;

    let reconciler = Reconciler::new(config(3, 2), store, cluster.clone());
    reconciler.full_resync().await.unwrap();

    let first = reconciler.process_next().await.unwrap();
    assert!(matches!(first, TaskOutcome::Retrying { attempts: 1, .. }));
    let status = reconciler.status().get(&web()).await.unwrap();
    assert_eq!(status.status, ReconciliationStatus::Degraded);
    assert_eq!(status.attempts, 1);

    assert_eq!(reconciler.run_until_idle().await, vec![TaskOutcome::Synced]);
    assert_eq!(cluster.apply_calls().await, 2);
}

#[tokio::test]
async fn test_conflicts_do_not_consume_retry_budget() {
    let store = Arc::new(MemoryDesiredStore::new());
    let memory = Arc::new(MemoryCluster::new());
    let web = web();
    memory.put(&web, json!({"spec": {"replicas": 1}})).await;
    store.declare(&web, json!({"spec": {"replicas": 3}})).await;

    // A single attempt: any budget charge would be terminal.
    let reconciler = Reconciler::new(config(1, 2), store, memory.clone());
    reconciler.full_resync().await.unwrap();

    // Another writer bumps the version after the observer's listing.
    memory.put(&web, json!({"spec": {"replicas": 1, "paused": false}})).await;

    let outcomes = reconciler.run_until_idle().await;
    assert_eq!(
        outcomes,
        vec![TaskOutcome::Conflict { conflicts: 1 }, TaskOutcome::Synced]
    );
    assert_eq!(
        memory.spec(&web).await,
        Some(json!({"spec": {"replicas": 3, "paused": false}}))
    );
}

#[tokio::test]
async fn test_conflicts_beyond_allowance_count_as_attempts() {
    let store = Arc::new(MemoryDesiredStore::new());
    let cluster = Arc::new(FlakyCluster::new(Arc::new(MemoryCluster::new())));
    let conflict = ClusterError::Conflict {
        expected: None,
        actual: Some(ResourceVersion::new(9)),
    };
    cluster.fail_applies(10, conflict).await;
    store.declare(&web(), json!({"spec": {"replicas": 3}})).await;

    let reconciler = Reconciler::new(config(2, 2), store, cluster.clone());
    reconciler.full_resync().await.unwrap();
    let outcomes = reconciler.run_until_idle().await;

    assert_eq!(outcomes.len(), 6);
    assert_eq!(outcomes[0], TaskOutcome::Conflict { conflicts: 1 });
    assert_eq!(outcomes[1], TaskOutcome::Conflict { conflicts: 2 });
    assert!(matches!(outcomes[2], TaskOutcome::Retrying { attempts: 1, .. }));
    assert_eq!(outcomes[3], TaskOutcome::Conflict { conflicts: 1 });
    assert_eq!(outcomes[4], TaskOutcome::Conflict { conflicts: 2 });
    assert!(matches!(
        &outcomes[5],
        TaskOutcome::Failed(ReconcileError::RetryBudgetExhausted { attempts: 2, .. })
    ));
    assert_eq!(cluster.apply_calls().await, 6);
}

#[tokio::test]
async fn test_rejection_is_terminal_until_desired_changes() {
    let store = Arc::new(MemoryDesiredStore::new());
    let cluster = Arc::new(FlakyCluster::new(Arc::new(MemoryCluster::new())));
    store.declare(&web(), json!({"spec": {"replicas": -2}})).await;

    let reconciler = Reconciler::new(config(5, 2), store.clone(), cluster.clone());
    reconciler.full_resync().await.unwrap();

    let outcomes = reconciler.run_until_idle().await;
    assert!(matches!(
        &outcomes[..],
        [TaskOutcome::Failed(ReconcileError::ValidationRejected(_))]
    ));
    assert_eq!(cluster.apply_calls().await, 1);
    assert_eq!(
        reconciler.status_of(&web()).await,
        Some(ReconciliationStatus::Error)
    );

    // A periodic resync does not retry the rejected generation.
    reconciler.full_resync().await.unwrap();
    assert!(reconciler.run_until_idle().await.is_empty());
    assert_eq!(cluster.apply_calls().await, 1);

    // A corrected declaration does.
    store.declare(&web(), json!({"spec": {"replicas": 2}})).await;
    reconciler.sync_desired().await.unwrap();
    assert_eq!(reconciler.run_until_idle().await, vec![TaskOutcome::Synced]);
    let status = reconciler.status().get(&web()).await.unwrap();
    assert_eq!(status.generation, Generation::new(2));
    assert_eq!(status.status, ReconciliationStatus::Synced);
}

#[tokio::test]
async fn test_operator_retry_resets_budget() {
    let store = Arc::new(MemoryDesiredStore::new());
    let cluster = Arc::new(FlakyCluster::new(Arc::new(MemoryCluster::new())));
    cluster.fail_applies(2, unavailable()).await;
    store.declare(&web(), json!({"spec": {"replicas": 3}})).await;

    let reconciler = Reconciler::new(config(2, 2), store, cluster.clone());
    reconciler.full_resync().await.unwrap();
    reconciler.run_until_idle().await;
    assert_eq!(
        reconciler.status_of(&web()).await,
        Some(ReconciliationStatus::Error)
    );

    assert_eq!(reconciler.force_retry(&web()).await.unwrap(), Generation::new(1));
    assert_eq!(reconciler.run_until_idle().await, vec![TaskOutcome::Synced]);
    assert_eq!(cluster.apply_calls().await, 3);
}

#[tokio::test]
async fn test_auto_sync_off_reports_out_of_sync() {
    let store = Arc::new(MemoryDesiredStore::new());
    let memory = Arc::new(MemoryCluster::new());
    let web = web();
    memory.put(&web, json!({"spec": {"replicas": 1}})).await;
    store
        .declare_with(&web, json!({"spec": {"replicas": 3}}), Ownership::none(), false)
        .await;

    let reconciler = Reconciler::new(config(3, 2), store, memory.clone());
    reconciler.full_resync().await.unwrap();

    assert_eq!(reconciler.run_until_idle().await, vec![TaskOutcome::OutOfSync]);
    let status = reconciler.status().get(&web).await.unwrap();
    assert_eq!(status.status, ReconciliationStatus::OutOfSync);
    assert_eq!(status.diff.unwrap().modifies, 1);
    assert_eq!(memory.spec(&web).await, Some(json!({"spec": {"replicas": 1}})));
}

#[tokio::test]
async fn test_store_outage_pauses_and_resumes() {
    init_tracing();
    let inner = Arc::new(MemoryDesiredStore::new());
    let store = Arc::new(ToggleStore::new(inner.clone() as Arc<dyn DesiredStateStore>));
    let memory = Arc::new(MemoryCluster::new());
    let web = web();
    inner.declare(&web, json!({"spec": {"replicas": 3}})).await;

    let reconciler = Reconciler::new(config(3, 2), store.clone(), memory.clone());
    reconciler.full_resync().await.unwrap();
    reconciler.run_until_idle().await;

    store.set_available(false);
    inner.declare(&web, json!({"spec": {"replicas": 5}})).await;
    assert!(matches!(
        reconciler.sync_desired().await,
        Err(ReconcileError::StoreUnavailable(_))
    ));
    assert!(matches!(
        reconciler.status().condition().await,
        ProcessCondition::Degraded { .. }
    ));

    // Drift keeps arriving, but nothing is applied while paused.
    memory.put(&web, json!({"spec": {"replicas": 0}})).await;
    assert_eq!(reconciler.sync_observed().await.unwrap(), 1);
    assert!(reconciler.queue().is_paused().await);
    assert!(reconciler.run_until_idle().await.is_empty());
    assert_eq!(memory.spec(&web).await, Some(json!({"spec": {"replicas": 0}})));

    store.set_available(true);
    reconciler.sync_desired().await.unwrap();
    assert!(reconciler.status().condition().await.is_healthy());
    assert!(!reconciler.queue().is_paused().await);

    // The drift task is replaced by the newer generation; one apply catches up.
    assert_eq!(reconciler.run_until_idle().await, vec![TaskOutcome::Synced]);
    assert_eq!(memory.spec(&web).await, Some(json!({"spec": {"replicas": 5}})));
    let status = reconciler.status().get(&web).await.unwrap();
    assert_eq!(status.generation, Generation::new(2));
}

#[tokio::test]
async fn test_expired_desired_token_relists() {
    let inner = Arc::new(MemoryDesiredStore::new());
    let store = Arc::new(ToggleStore::new(inner.clone() as Arc<dyn DesiredStateStore>));
    let memory = Arc::new(MemoryCluster::new());
    let web = web();
    let api = ResourceKey::new(ResourceKind::Deployment, "default", "api").unwrap();
    inner.declare(&web, json!({"spec": {"replicas": 1}})).await;
    inner.declare(&api, json!({"spec": {"replicas": 1}})).await;

    let reconciler = Reconciler::new(config(3, 2), store.clone(), memory.clone());
    reconciler.full_resync().await.unwrap();
    reconciler.run_until_idle().await;

    inner.declare(&web, json!({"spec": {"replicas": 4}})).await;
    inner.remove(&api).await;
    store.expire_next_changes();
    reconciler.sync_desired().await.unwrap();
    assert!(reconciler.status().condition().await.is_healthy());

    reconciler.run_until_idle().await;
    assert_eq!(memory.spec(&web).await, Some(json!({"spec": {"replicas": 4}})));
    assert!(reconciler.desired(&api).await.is_none());
    // Without pruning the live resource stays and its status is dropped.
    assert!(memory.spec(&api).await.is_some());
    assert!(reconciler.status().get(&api).await.is_none());
}

#[tokio::test]
async fn test_watch_failure_does_not_lose_changes() {
    let store = Arc::new(MemoryDesiredStore::new());
    let memory = Arc::new(MemoryCluster::new());
    let cluster = Arc::new(FlakyCluster::new(memory.clone()));
    let web = web();
    store.declare(&web, json!({"spec": {"replicas": 3}})).await;

    let reconciler = Reconciler::new(config(3, 2), store, cluster.clone());
    reconciler.full_resync().await.unwrap();
    reconciler.run_until_idle().await;

    memory.put(&web, json!({"spec": {"replicas": 8}})).await;
    cluster.fail_watch(ClusterError::Timeout(Duration::from_secs(1))).await;
    assert!(reconciler.sync_observed().await.is_err());

    // The cursor did not move; the next poll sees the drift.
    assert_eq!(reconciler.sync_observed().await.unwrap(), 1);
    assert_eq!(reconciler.run_until_idle().await, vec![TaskOutcome::Synced]);
    assert_eq!(memory.spec(&web).await, Some(json!({"spec": {"replicas": 3}})));
}
