//! Convergence scenarios across the store, observer, reconciler and executor.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p steward-e2e --test convergence
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{json, Value};
use steward_id::{Generation, ResourceKey, ResourceKind};
use steward_reconcile::{
    diff, ActionExecutor, ApplyError, ClusterApi, DesiredResource, MemoryCluster,
    MemoryDesiredStore, Ownership, ReconciliationStatus, Reconciler, ReconcilerConfig,
    TaskOutcome,
};
use steward_testing::{eventually, init_tracing, FlakyCluster, Fault, OverlapTracker};
use tokio::sync::watch;

fn deployment(name: &str) -> ResourceKey {
    ResourceKey::new(ResourceKind::Deployment, "default", name).unwrap()
}

#[tokio::test]
async fn test_scale_one_to_three() {
    init_tracing();
    let store = Arc::new(MemoryDesiredStore::new());
    let memory = Arc::new(MemoryCluster::new());
    let cluster = Arc::new(FlakyCluster::new(memory.clone()));
    let web = deployment("web");

    memory
        .put(&web, json!({"spec": {"replicas": 1, "image": "web:1"}}))
        .await;
    store
        .declare(&web, json!({"spec": {"replicas": 3, "image": "web:1"}}))
        .await;

    let reconciler = Reconciler::new(ReconcilerConfig::default(), store, cluster.clone());
    reconciler.full_resync().await.unwrap();

    assert_eq!(reconciler.run_until_idle().await, vec![TaskOutcome::Synced]);
    assert_eq!(
        memory.spec(&web).await,
        Some(json!({"spec": {"replicas": 3, "image": "web:1"}}))
    );
    assert_eq!(cluster.apply_calls().await, 1);

    let status = reconciler.status().get(&web).await.unwrap();
    assert_eq!(status.status, ReconciliationStatus::Synced);
    assert_eq!(status.generation, Generation::new(1));

    // A second pass over an in-sync resource issues nothing.
    reconciler.full_resync().await.unwrap();
    assert_eq!(reconciler.run_until_idle().await, vec![TaskOutcome::Synced]);
    assert_eq!(cluster.apply_calls().await, 1);
}

#[tokio::test]
async fn test_partial_ownership_keeps_foreign_fields() {
    let store = Arc::new(MemoryDesiredStore::new());
    let cluster = Arc::new(MemoryCluster::new());
    let web = deployment("web");

    cluster
        .put(&web, json!({"spec": {"replicas": 1, "paused": true}, "status": {"ready": 1}}))
        .await;
    store
        .declare_with(
            &web,
            json!({"spec": {"replicas": 2}}),
            Ownership::fields(["spec.replicas"]),
            true,
        )
        .await;

    let reconciler = Reconciler::new(ReconcilerConfig::default(), store, cluster.clone());
    reconciler.full_resync().await.unwrap();
    assert_eq!(reconciler.run_until_idle().await, vec![TaskOutcome::Synced]);

    assert_eq!(
        cluster.spec(&web).await,
        Some(json!({"spec": {"replicas": 2, "paused": true}, "status": {"ready": 1}}))
    );
}

#[tokio::test]
async fn test_drift_is_corrected_after_watch() {
    let store = Arc::new(MemoryDesiredStore::new());
    let cluster = Arc::new(MemoryCluster::new());
    let web = deployment("web");
    store.declare(&web, json!({"spec": {"replicas": 3}})).await;

    let reconciler = Reconciler::new(ReconcilerConfig::default(), store, cluster.clone());
    reconciler.full_resync().await.unwrap();
    reconciler.run_until_idle().await;

    // Someone scales it down by hand.
    cluster.put(&web, json!({"spec": {"replicas": 0}})).await;
    assert_eq!(reconciler.sync_observed().await.unwrap(), 1);
    assert_eq!(reconciler.run_until_idle().await, vec![TaskOutcome::Synced]);
    assert_eq!(cluster.spec(&web).await, Some(json!({"spec": {"replicas": 3}})));
}

#[tokio::test]
async fn test_expired_watch_token_triggers_full_resync() {
    let store = Arc::new(MemoryDesiredStore::new());
    let cluster = Arc::new(MemoryCluster::with_retention(2));
    let web = deployment("web");
    let api = deployment("api");
    store.declare(&web, json!({"spec": {"replicas": 3}})).await;
    store.declare(&api, json!({"spec": {"replicas": 2}})).await;

    let reconciler = Reconciler::new(ReconcilerConfig::default(), store, cluster.clone());
    reconciler.full_resync().await.unwrap();
    reconciler.run_until_idle().await;

    // More out-of-band writes than the cluster keeps history for.
    cluster.put(&web, json!({"spec": {"replicas": 9}})).await;
    for name in ["noise-a", "noise-b", "noise-c"] {
        cluster.put(&deployment(name), json!({"spec": {}})).await;
    }

    // Every declared key is reconciled once; undeclared keys are ignored.
    assert_eq!(reconciler.sync_observed().await.unwrap(), 2);
    let outcomes = reconciler.run_until_idle().await;
    assert_eq!(outcomes, vec![TaskOutcome::Synced, TaskOutcome::Synced]);
    assert_eq!(cluster.spec(&web).await, Some(json!({"spec": {"replicas": 3}})));
    assert_eq!(cluster.spec(&deployment("noise-a")).await, Some(json!({"spec": {}})));
}

#[tokio::test]
async fn test_parallel_keys_never_overlap_per_key() {
    init_tracing();
    let store = Arc::new(MemoryDesiredStore::new());
    let tracker = OverlapTracker::new();
    let cluster = Arc::new(FlakyCluster::new(Arc::new(MemoryCluster::new())).with_tracker(tracker.clone()));
    cluster.set_apply_delay(Duration::from_millis(20)).await;

    let keys: Vec<ResourceKey> = (0..6).map(|i| deployment(&format!("app-{i}"))).collect();
    for key in &keys {
        store.declare(key, json!({"spec": {"replicas": 1}})).await;
    }

    let config = ReconcilerConfig {
        workers: 4,
        desired_poll_interval: Duration::from_millis(5),
        observe_poll_interval: Duration::from_millis(5),
        ..ReconcilerConfig::default()
    };
    let reconciler = Reconciler::new(config, store.clone(), cluster.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.run(shutdown_rx).await }
    });

    // Keep changing desired state while workers are applying.
    for replicas in 2..=5 {
        tokio::time::sleep(Duration::from_millis(7)).await;
        for key in &keys {
            store.declare(key, json!({"spec": {"replicas": replicas}})).await;
        }
    }

    let converged = eventually(Duration::from_secs(10), || {
        let reconciler = reconciler.clone();
        let keys = keys.clone();
        async move {
            for key in &keys {
                match reconciler.status().get(key).await {
                    Some(status)
                        if status.status == ReconciliationStatus::Synced
                            && status.generation == Generation::new(5) => {}
                    _ => return false,
                }
            }
            true
        }
    })
    .await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    assert!(converged, "resources did not converge to the last generation");
    assert_eq!(tracker.overlaps(), 0);
    assert_eq!(tracker.max_per_key(), 1);
    assert!(tracker.max_concurrency() > 1, "keys were not reconciled in parallel");
}

#[tokio::test]
async fn test_newer_generation_supersedes_in_flight_apply() {
    let store = Arc::new(MemoryDesiredStore::new());
    let memory = Arc::new(MemoryCluster::new());
    let tracker = OverlapTracker::new();
    let cluster = Arc::new(FlakyCluster::new(memory.clone()).with_tracker(tracker.clone()));
    cluster
        .push_apply_fault(Fault::Delay(Duration::from_millis(200)))
        .await;
    let web = deployment("web");
    store.declare(&web, json!({"spec": {"replicas": 1}})).await;

    let config = ReconcilerConfig {
        workers: 2,
        desired_poll_interval: Duration::from_millis(5),
        observe_poll_interval: Duration::from_millis(5),
        ..ReconcilerConfig::default()
    };
    let reconciler = Reconciler::new(config, store.clone(), cluster.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let reconciler = reconciler.clone();
        async move { reconciler.run(shutdown_rx).await }
    });

    assert!(
        eventually(Duration::from_secs(5), || {
            let tracker = tracker.clone();
            async move { tracker.entries() >= 1 }
        })
        .await
    );
    store.declare(&web, json!({"spec": {"replicas": 7}})).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let converged = eventually(Duration::from_secs(10), || {
        let reconciler = reconciler.clone();
        let web = web.clone();
        let seen = seen.clone();
        async move {
            match reconciler.status().get(&web).await {
                Some(status) => {
                    seen.lock().unwrap().push(status.generation);
                    status.generation == Generation::new(2)
                        && status.status == ReconciliationStatus::Synced
                }
                None => false,
            }
        }
    })
    .await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    assert!(converged);
    let seen = seen.lock().unwrap().clone();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "generation went backwards: {seen:?}");
    assert_eq!(memory.spec(&web).await, Some(json!({"spec": {"replicas": 7}})));
    assert_eq!(tracker.overlaps(), 0);
}

// =============================================================================
// Idempotence
// =============================================================================

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        (0i64..5).prop_map(Value::from),
        "[xyz]{1,2}".prop_map(Value::from),
        prop::collection::vec(0i64..3, 0..3).prop_map(|v| json!(v)),
    ]
}

fn document() -> impl Strategy<Value = Value> {
    let inner = prop::collection::btree_map("[abc]", leaf(), 0..3)
        .prop_map(|m| Value::Object(m.into_iter().collect()));
    prop::collection::btree_map("[abcd]", prop_oneof![leaf(), inner], 0..4)
        .prop_map(|m: BTreeMap<String, Value>| Value::Object(m.into_iter().collect()))
}

fn widget() -> ResourceKey {
    ResourceKey::new(ResourceKind::Custom("Widget".to_string()), "default", "w").unwrap()
}

/// Applies the diff twice and returns the live document after each apply.
async fn apply_twice(
    desired: Value,
    observed: Option<Value>,
    ownership: Ownership,
) -> (Option<Value>, Option<Value>, bool) {
    let cluster = Arc::new(MemoryCluster::new());
    let key = widget();
    let version = match &observed {
        Some(spec) => Some(cluster.put(&key, spec.clone()).await),
        None => None,
    };

    let want = DesiredResource {
        key: key.clone(),
        spec: desired,
        generation: Generation::new(1),
        ownership,
        auto_sync: true,
    };
    let delta = diff(&key.kind, &want.spec, observed.as_ref(), &want.ownership);
    let executor = ActionExecutor::new(cluster.clone());

    let first = executor.apply(&key, &delta, Some(&want), version).await;
    assert!(first.is_ok(), "first apply failed: {first:?}");
    let after_first = cluster.spec(&key).await;

    let second = executor.apply(&key, &delta, Some(&want), version).await;
    assert!(
        matches!(second, Ok(_) | Err(ApplyError::Conflict(_))),
        "second apply failed: {second:?}"
    );
    let after_second = cluster.spec(&key).await;

    let current = cluster.get(&key).await.unwrap().map(|r| r.spec);
    let converged = diff(&key.kind, &want.spec, current.as_ref(), &want.ownership).is_empty();
    (after_first, after_second, converged)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_apply_twice_equals_apply_once(
        desired in document(),
        observed in prop::option::of(document()),
        full in any::<bool>(),
    ) {
        let ownership = if full { Ownership::Full } else { Ownership::none() };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (first, second, converged) =
            runtime.block_on(apply_twice(desired, observed, ownership));
        prop_assert_eq!(first, second);
        prop_assert!(converged);
    }
}
