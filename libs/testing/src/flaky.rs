use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use steward_id::{ResourceKey, ResourceVersion};
use steward_reconcile::{
    ClusterApi, ClusterError, ClusterSnapshot, ObservedResource, Operation, ResumeToken,
    WatchBatch,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::overlap::OverlapTracker;

/// A scripted misbehaviour for the next call.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail without reaching the wrapped cluster.
    Fail(ClusterError),

    /// Sleep, then forward to the wrapped cluster.
    Delay(Duration),
}

#[derive(Debug, Default)]
struct Script {
    applies: VecDeque<Fault>,
    watches: VecDeque<ClusterError>,
    gets: VecDeque<ClusterError>,
    apply_delay: Duration,
    apply_calls: usize,
    apply_calls_by_key: BTreeMap<ResourceKey, usize>,
}

/// A [`ClusterApi`] that fails on cue.
///
/// Faults are consumed in order, one per call. Calls with no scripted fault
/// go straight to the wrapped cluster.
pub struct FlakyCluster {
    inner: Arc<dyn ClusterApi>,
    script: Mutex<Script>,
    tracker: Option<OverlapTracker>,
}

impl FlakyCluster {
    pub fn new(inner: Arc<dyn ClusterApi>) -> Self {
        Self {
            inner,
            script: Mutex::new(Script::default()),
            tracker: None,
        }
    }

    /// Report every apply to `tracker`.
    pub fn with_tracker(mut self, tracker: OverlapTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Fail the next `count` applies with `error`.
    pub async fn fail_applies(&self, count: usize, error: ClusterError) {
        let mut script = self.script.lock().await;
        for _ in 0..count {
            script.applies.push_back(Fault::Fail(error.clone()));
        }
    }

    /// Script the next apply.
    pub async fn push_apply_fault(&self, fault: Fault) {
        self.script.lock().await.applies.push_back(fault);
    }

    /// Delay every apply by `delay` so that concurrent calls have room to overlap.
    pub async fn set_apply_delay(&self, delay: Duration) {
        self.script.lock().await.apply_delay = delay;
    }

    /// Fail the next watch call with `error`.
    pub async fn fail_watch(&self, error: ClusterError) {
        self.script.lock().await.watches.push_back(error);
    }

    /// Fail the next get call with `error`.
    pub async fn fail_get(&self, error: ClusterError) {
        self.script.lock().await.gets.push_back(error);
    }

    /// Apply calls made so far, including failed ones.
    pub async fn apply_calls(&self) -> usize {
        self.script.lock().await.apply_calls
    }

    pub async fn apply_calls_for(&self, key: &ResourceKey) -> usize {
        self.script
            .lock()
            .await
            .apply_calls_by_key
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Scripted apply faults not consumed yet.
    pub async fn remaining_apply_faults(&self) -> usize {
        self.script.lock().await.applies.len()
    }
}

#[async_trait]
impl ClusterApi for FlakyCluster {
    async fn list(&self) -> Result<ClusterSnapshot, ClusterError> {
        self.inner.list().await
    }

    async fn watch(&self, after: ResumeToken, limit: usize) -> Result<WatchBatch, ClusterError> {
        if let Some(error) = self.script.lock().await.watches.pop_front() {
            debug!(error = %error, "Injected watch failure");
            return Err(error);
        }
        self.inner.watch(after, limit).await
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, ClusterError> {
        if let Some(error) = self.script.lock().await.gets.pop_front() {
            debug!(key = %key, error = %error, "Injected get failure");
            return Err(error);
        }
        self.inner.get(key).await
    }

    async fn apply(
        &self,
        key: &ResourceKey,
        operation: &Operation,
        expected: Option<ResourceVersion>,
    ) -> Result<ResourceVersion, ClusterError> {
        let _guard = self.tracker.as_ref().map(|tracker| tracker.enter(key));

        let (fault, delay) = {
            let mut script = self.script.lock().await;
            script.apply_calls += 1;
            *script.apply_calls_by_key.entry(key.clone()).or_default() += 1;
            (script.applies.pop_front(), script.apply_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match fault {
            Some(Fault::Fail(error)) => {
                debug!(key = %key, operation = operation.name(), error = %error, "Injected apply failure");
                Err(error)
            }
            Some(Fault::Delay(extra)) => {
                tokio::time::sleep(extra).await;
                self.inner.apply(key, operation, expected).await
            }
            None => self.inner.apply(key, operation, expected).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steward_id::ResourceKind;
    use steward_reconcile::MemoryCluster;

    fn key() -> ResourceKey {
        ResourceKey::new(ResourceKind::ConfigMap, "default", "settings").unwrap()
    }

    #[tokio::test]
    async fn test_scripted_failures_then_passthrough() {
        let cluster = FlakyCluster::new(Arc::new(MemoryCluster::new()));
        cluster
            .fail_applies(2, ClusterError::Unavailable("injected".to_string()))
            .await;

        let create = Operation::Create {
            spec: json!({"data": {"a": "1"}}),
        };
        assert!(cluster.apply(&key(), &create, None).await.is_err());
        assert!(cluster.apply(&key(), &create, None).await.is_err());
        assert!(cluster.apply(&key(), &create, None).await.is_ok());

        assert_eq!(cluster.apply_calls().await, 3);
        assert_eq!(cluster.apply_calls_for(&key()).await, 3);
        assert_eq!(cluster.remaining_apply_faults().await, 0);
    }

    #[tokio::test]
    async fn test_watch_and_get_faults_fire_once() {
        let cluster = FlakyCluster::new(Arc::new(MemoryCluster::new()));
        cluster
            .fail_watch(ClusterError::Timeout(Duration::from_secs(1)))
            .await;
        cluster.fail_get(ClusterError::Unavailable("down".to_string())).await;

        assert!(cluster.watch(ResumeToken::START, 10).await.is_err());
        assert!(cluster.watch(ResumeToken::START, 10).await.is_ok());
        assert!(cluster.get(&key()).await.is_err());
        assert_eq!(cluster.get(&key()).await.unwrap(), None);
    }
}
