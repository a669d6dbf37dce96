//! Reconciliation loop.
//!
//! The reconciler:
//! - Follows the desired-state store and the live-state observer
//! - Enqueues a task whenever a key's desired generation changes or drift is observed
//! - Runs a bounded pool of workers that diff, apply and record status per key
//!
//! Per-key failures stay per key. Only an unreachable desired-state store
//! pauses the whole loop, and that is reported as a process condition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use steward_id::{Generation, ResourceKey};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{ClusterApi, ObservedResource, ResumeToken};
use crate::desired::{DesiredChange, DesiredResource, DesiredStateStore, StoreError};
use crate::diff::{self, Diff, DiffSummary};
use crate::error::ReconcileError;
use crate::executor::{ActionExecutor, ApplyError, ApplyOutcome};
use crate::observer::{ObserveOutcome, Observer};
use crate::queue::{Intent, ReconciliationTask, Trigger, WorkQueue};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::status::{ReconciliationStatus, StatusBoard, StatusUpdate};

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    /// Retry budget and backoff.
    pub retry: RetryPolicy,

    /// Maximum events fetched per desired-state or watch poll.
    pub watch_batch_size: usize,

    /// Interval between desired-state polls.
    pub desired_poll_interval: Duration,

    /// Interval between live-state polls.
    pub observe_poll_interval: Duration,

    /// Delete live resources that are removed from desired state.
    pub prune: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            watch_batch_size: 100,
            desired_poll_interval: Duration::from_secs(5),
            observe_poll_interval: Duration::from_secs(1),
            prune: false,
        }
    }
}

/// Result of processing one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Observed state matches desired.
    Synced,

    /// A change was applied but the follow-up read still differs; the key
    /// was requeued with a fresh read.
    Applied,

    /// Drift was found and left alone because auto-sync is off.
    OutOfSync,

    /// A resource removed from desired state was deleted (or already gone).
    Pruned,

    /// A retryable failure; the task is back in the queue after `delay`.
    Retrying { attempts: u32, delay: Duration },

    /// A version conflict; the task was requeued with a fresh read.
    Conflict { conflicts: u32 },

    /// Terminal failure for this generation.
    Failed(ReconcileError),

    /// A newer generation exists; the result was discarded.
    Superseded,
}

#[derive(Debug, Default)]
struct DesiredCache {
    resources: BTreeMap<ResourceKey, DesiredResource>,

    /// Keys removed from desired state while pruning, with the removal generation.
    removed: BTreeMap<ResourceKey, Generation>,

    token: ResumeToken,

    /// False until the first successful listing.
    listed: bool,
}

struct Inner {
    config: ReconcilerConfig,
    store: Arc<dyn DesiredStateStore>,
    observer: Observer,
    executor: ActionExecutor,
    queue: WorkQueue,
    status: StatusBoard,
    desired: RwLock<DesiredCache>,
}

/// Drives live state toward desired state.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        config: ReconcilerConfig,
        store: Arc<dyn DesiredStateStore>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        let observer = Observer::new(cluster.clone(), config.watch_batch_size);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                observer,
                executor: ActionExecutor::new(cluster),
                queue: WorkQueue::new(),
                status: StatusBoard::new(),
                desired: RwLock::new(DesiredCache::default()),
            }),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.inner.config
    }

    /// Status board shared with readers.
    pub fn status(&self) -> &StatusBoard {
        &self.inner.status
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.inner.queue
    }

    pub fn observer(&self) -> &Observer {
        &self.inner.observer
    }

    /// Cached desired state of one key.
    pub async fn desired(&self, key: &ResourceKey) -> Option<DesiredResource> {
        self.inner.desired.read().await.resources.get(key).cloned()
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let workers = self.inner.config.workers.max(1);
        info!(
            workers,
            desired_poll_ms = self.inner.config.desired_poll_interval.as_millis() as u64,
            observe_poll_ms = self.inner.config.observe_poll_interval.as_millis() as u64,
            prune = self.inner.config.prune,
            "Starting reconciliation loop"
        );

        if let Err(e) = self.full_resync().await {
            warn!(error = %e, "Initial resync failed, will retry");
        }

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let reconciler = self.clone();
            let shutdown = shutdown.clone();
            pool.spawn(async move { reconciler.work(worker, shutdown).await });
        }

        let floor = Duration::from_millis(1);
        let mut desired_interval =
            tokio::time::interval(self.inner.config.desired_poll_interval.max(floor));
        let mut observe_interval =
            tokio::time::interval(self.inner.config.observe_poll_interval.max(floor));

        loop {
            tokio::select! {
                _ = desired_interval.tick() => {
                    if let Err(e) = self.sync_desired().await {
                        warn!(error = %e, "Desired-state sync failed");
                    }
                }
                _ = observe_interval.tick() => {
                    if let Err(e) = self.sync_observed().await {
                        warn!(error = %e, "Live-state sync failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Reconciliation worker panicked");
            }
        }
    }

    async fn work(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "Worker started");
        while let Some(task) = self.inner.queue.next(&mut shutdown).await {
            tokio::select! {
                _ = self.process(task) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        debug!(worker, "Worker stopped");
    }

    /// Relist desired and live state and reconcile every declared key once.
    #[instrument(skip(self))]
    pub async fn full_resync(&self) -> Result<(), ReconcileError> {
        self.relist_desired().await?;
        let keys = self.inner.observer.resync().await?;
        self.enqueue_observed(&keys, Trigger::Resync).await;
        Ok(())
    }

    /// Pull the next batch of desired-state changes.
    ///
    /// Returns the number of changes applied. An unreachable store pauses the
    /// work queue and marks the process degraded until the store answers.
    pub async fn sync_desired(&self) -> Result<usize, ReconcileError> {
        let (listed, after) = {
            let cache = self.inner.desired.read().await;
            (cache.listed, cache.token)
        };
        if !listed {
            return self.relist_desired().await;
        }

        match self
            .inner
            .store
            .changes(after, self.inner.config.watch_batch_size)
            .await
        {
            Ok(batch) => {
                self.store_reachable().await;
                let count = batch.changes.len();
                for change in batch.changes {
                    self.apply_desired_change(change).await;
                }
                let mut cache = self.inner.desired.write().await;
                if batch.next > cache.token {
                    cache.token = batch.next;
                }
                Ok(count)
            }
            Err(StoreError::Expired(token)) => {
                warn!(token = %token, "Desired-state token expired, relisting");
                self.relist_desired().await
            }
            Err(e @ StoreError::Unavailable(_)) => Err(self.store_unreachable(e).await),
        }
    }

    async fn relist_desired(&self) -> Result<usize, ReconcileError> {
        let snapshot = match self.inner.store.list().await {
            Ok(snapshot) => snapshot,
            Err(e @ StoreError::Unavailable(_)) => return Err(self.store_unreachable(e).await),
            Err(e) => return Err(e.into()),
        };
        self.store_reachable().await;

        let listed: BTreeMap<ResourceKey, DesiredResource> = snapshot
            .resources
            .into_iter()
            .map(|resource| (resource.key.clone(), resource))
            .collect();

        let vanished: Vec<DesiredChange> = {
            let cache = self.inner.desired.read().await;
            cache
                .resources
                .values()
                .filter(|resource| !listed.contains_key(&resource.key))
                .map(|resource| DesiredChange::Removed {
                    key: resource.key.clone(),
                    generation: resource.generation.next(),
                })
                .collect()
        };

        let mut count = vanished.len();
        for change in vanished {
            self.apply_desired_change(change).await;
        }
        for resource in listed.into_values() {
            if self.apply_desired_change(DesiredChange::Upserted(resource)).await {
                count += 1;
            }
        }

        let mut cache = self.inner.desired.write().await;
        cache.token = snapshot.token;
        cache.listed = true;
        info!(
            resources = cache.resources.len(),
            token = %snapshot.token,
            "Desired state listed"
        );
        Ok(count)
    }

    /// Fold one desired-state change into the cache and queue.
    ///
    /// Returns false if the change was not newer than what is cached.
    async fn apply_desired_change(&self, change: DesiredChange) -> bool {
        match change {
            DesiredChange::Upserted(resource) => {
                let key = resource.key.clone();
                let generation = resource.generation;
                {
                    let mut cache = self.inner.desired.write().await;
                    if let Some(cached) = cache.resources.get(&key) {
                        if cached.generation >= generation {
                            return false;
                        }
                    }
                    cache.removed.remove(&key);
                    cache.resources.insert(key.clone(), resource);
                }

                debug!(key = %key, generation = %generation, "Desired state changed");
                self.inner
                    .status
                    .record(&key, generation, StatusUpdate::pending())
                    .await;
                self.inner
                    .queue
                    .enqueue(ReconciliationTask::new(key, generation, Trigger::DesiredChanged))
                    .await;
                true
            }
            DesiredChange::Removed { key, generation } => {
                let existed = self
                    .inner
                    .desired
                    .write()
                    .await
                    .resources
                    .remove(&key)
                    .is_some();
                if !existed {
                    return false;
                }

                self.inner.queue.cancel(&key, generation).await;
                if self.inner.config.prune {
                    info!(key = %key, generation = %generation, "Resource removed from desired state, pruning");
                    self.inner.desired.write().await.removed.insert(key.clone(), generation);
                    self.inner
                        .status
                        .record(&key, generation, StatusUpdate::pending())
                        .await;
                    self.inner
                        .queue
                        .enqueue(ReconciliationTask::deletion(key, generation))
                        .await;
                } else {
                    info!(key = %key, generation = %generation, "Resource removed from desired state, leaving live resource");
                    self.inner.status.forget(&key, generation).await;
                }
                true
            }
        }
    }

    async fn store_unreachable(&self, err: StoreError) -> ReconcileError {
        let err = ReconcileError::from(err);
        if !self.inner.queue.is_paused().await {
            error!(error = %err, "Desired-state store unreachable, pausing reconciliation");
        }
        self.inner.queue.pause().await;
        self.inner.status.set_degraded(err.to_string()).await;
        err
    }

    async fn store_reachable(&self) {
        if self.inner.queue.is_paused().await {
            info!("Desired-state store reachable again, resuming reconciliation");
            self.inner.status.set_healthy().await;
            self.inner.queue.resume().await;
        }
    }

    /// Pull the next batch of live-state changes and enqueue drifted keys.
    ///
    /// Returns the number of keys enqueued.
    pub async fn sync_observed(&self) -> Result<usize, ReconcileError> {
        let outcome = self.inner.observer.poll().await?;
        let trigger = match outcome {
            ObserveOutcome::Changed(_) => Trigger::Drift,
            ObserveOutcome::Resynced(_) => Trigger::Resync,
        };
        Ok(self.enqueue_observed(outcome.keys(), trigger).await)
    }

    async fn enqueue_observed(&self, keys: &[ResourceKey], trigger: Trigger) -> usize {
        let mut enqueued = 0;
        for key in keys {
            let (desired, removed) = {
                let cache = self.inner.desired.read().await;
                (
                    cache.resources.get(key).map(|r| r.generation),
                    cache.removed.get(key).copied(),
                )
            };

            let task = match (desired, removed) {
                (Some(generation), _) => ReconciliationTask::new(key.clone(), generation, trigger),
                (None, Some(generation)) => ReconciliationTask::deletion(key.clone(), generation),
                (None, None) => continue,
            };
            if let Some(status) = self.inner.status.get(key).await {
                if status.generation == task.generation && status.status.is_terminal() {
                    debug!(key = %key, "Ignoring drift for errored resource");
                    continue;
                }
            }
            let generation = task.generation;
            if self.inner.queue.enqueue(task).await {
                self.inner
                    .status
                    .record(key, generation, StatusUpdate::pending())
                    .await;
                enqueued += 1;
            }
        }
        enqueued
    }

    /// Operator-forced retry of the current generation, resetting its budget.
    ///
    /// A removed key whose prune is still outstanding retries the deletion.
    pub async fn force_retry(&self, key: &ResourceKey) -> Result<Generation, ReconcileError> {
        let mut task = {
            let cache = self.inner.desired.read().await;
            match (cache.resources.get(key), cache.removed.get(key)) {
                (Some(resource), _) => {
                    ReconciliationTask::new(key.clone(), resource.generation, Trigger::Operator)
                }
                (None, Some(&generation)) => ReconciliationTask {
                    trigger: Trigger::Operator,
                    ..ReconciliationTask::deletion(key.clone(), generation)
                },
                (None, None) => return Err(ReconcileError::NotDeclared(key.clone())),
            }
        };
        let generation = task.generation;

        info!(key = %key, generation = %generation, intent = ?task.intent, "Operator requested retry");
        self.inner
            .status
            .record(key, generation, StatusUpdate::pending())
            .await;
        task.refetch = true;
        self.inner.queue.enqueue(task).await;
        Ok(generation)
    }

    /// Process the next ready task, if any, on the calling task.
    pub async fn process_next(&self) -> Option<TaskOutcome> {
        let task = self.inner.queue.try_next().await?;
        Some(self.process(task).await)
    }

    /// Process ready tasks until none is left. Returns the outcomes in order.
    pub async fn run_until_idle(&self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process_next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[instrument(
        skip(self, task),
        fields(
            key = %task.key,
            generation = %task.generation,
            trigger = %task.trigger,
            attempt = task.attempts + 1
        )
    )]
    async fn process(&self, task: ReconciliationTask) -> TaskOutcome {
        let key = task.key.clone();
        let generation = task.generation;

        let outcome = match task.intent {
            Intent::Apply => self.process_apply(task).await,
            Intent::Delete => self.process_delete(task).await,
        };

        self.inner.queue.complete(&key, generation).await;
        outcome
    }

    async fn process_apply(&self, task: ReconciliationTask) -> TaskOutcome {
        let key = &task.key;
        let generation = task.generation;

        let desired = match self.desired(key).await {
            Some(desired) if desired.generation == generation => desired,
            _ => return TaskOutcome::Superseded,
        };
        if !self.record(&task, StatusUpdate::syncing(task.attempts)).await {
            return TaskOutcome::Superseded;
        }

        let observed = match self.read_observed(&task).await {
            Ok(observed) => observed,
            Err(e) => return self.on_failure(task, ApplyError::Transient(e.to_string()), None).await,
        };

        let diff = diff::diff(
            &key.kind,
            &desired.spec,
            observed.as_ref().map(|o| &o.spec),
            &desired.ownership,
        );
        if diff.is_empty() {
            self.record(&task, StatusUpdate::synced()).await;
            return TaskOutcome::Synced;
        }

        let summary = diff.summary();
        if !desired.auto_sync {
            info!(key = %key, diff = %summary, "Drift detected, auto-sync disabled");
            self.record(&task, StatusUpdate::out_of_sync(summary)).await;
            return TaskOutcome::OutOfSync;
        }

        let expected = observed.as_ref().map(|o| o.version);
        let result = self
            .inner
            .executor
            .apply(key, &diff, Some(&desired), expected)
            .await;
        if self.inner.queue.is_superseded(key, generation).await {
            debug!(key = %key, "Discarding apply result for superseded generation");
            return TaskOutcome::Superseded;
        }

        match result {
            Ok(ApplyOutcome::Applied { .. }) | Ok(ApplyOutcome::AlreadyConverged) => {
                self.verify(&task, &desired, summary).await
            }
            Err(err) => self.on_failure(task, err, Some(summary)).await,
        }
    }

    /// Re-read the key after a successful apply and report Synced if it now matches.
    ///
    /// A key that still differs (another writer got in between) is requeued
    /// with a fresh read. Those follow-ups share the conflict allowance; past
    /// it they are charged against the retry budget.
    async fn verify(
        &self,
        task: &ReconciliationTask,
        desired: &DesiredResource,
        applied: DiffSummary,
    ) -> TaskOutcome {
        let observed = match self.inner.observer.refresh(&task.key).await {
            Ok(observed) => observed,
            Err(e) => {
                let err = ApplyError::Transient(format!("verification read failed: {e}"));
                return self.on_failure(task.clone(), err, Some(applied)).await;
            }
        };

        let remaining = diff::diff(
            &task.key.kind,
            &desired.spec,
            observed.as_ref().map(|o| &o.spec),
            &desired.ownership,
        );
        if remaining.is_empty() {
            info!(key = %task.key, generation = %task.generation, changes = %applied, "Resource synced");
            self.record(task, StatusUpdate::synced()).await;
            return TaskOutcome::Synced;
        }

        let summary = remaining.summary();
        let conflicts = task.conflicts + 1;
        if !self.inner.config.retry.absorbs_conflict(conflicts) {
            let err = ApplyError::Conflict(format!("{} still differs after apply: {summary}", task.key));
            return self.on_failure(task.clone(), err, Some(summary)).await;
        }

        debug!(key = %task.key, conflicts, diff = %summary, "Resource changed after apply, re-reading");
        self.record(task, StatusUpdate::syncing(task.attempts).with_diff(summary))
            .await;
        let mut next = task.clone();
        next.conflicts = conflicts;
        next.refetch = true;
        next.trigger = Trigger::Drift;
        self.inner.queue.enqueue(next).await;
        TaskOutcome::Applied
    }

    async fn process_delete(&self, task: ReconciliationTask) -> TaskOutcome {
        let key = &task.key;
        if self.inner.queue.is_superseded(key, task.generation).await {
            return TaskOutcome::Superseded;
        }
        if !self.record(&task, StatusUpdate::syncing(task.attempts)).await {
            return TaskOutcome::Superseded;
        }

        let observed = match self.read_observed(&task).await {
            Ok(observed) => observed,
            Err(e) => return self.on_failure(task, ApplyError::Transient(e.to_string()), None).await,
        };
        let Some(observed) = observed else {
            self.inner.status.forget(key, task.generation).await;
            return TaskOutcome::Pruned;
        };

        let diff = Diff::deletion(&observed.spec);
        let result = self
            .inner
            .executor
            .apply(key, &diff, None, Some(observed.version))
            .await;
        if self.inner.queue.is_superseded(key, task.generation).await {
            return TaskOutcome::Superseded;
        }

        match result {
            Ok(_) => {
                info!(key = %key, "Pruned resource");
                self.inner.status.forget(key, task.generation).await;
                TaskOutcome::Pruned
            }
            Err(err) => self.on_failure(task, err, Some(diff.summary())).await,
        }
    }

    async fn read_observed(
        &self,
        task: &ReconciliationTask,
    ) -> Result<Option<ObservedResource>, ReconcileError> {
        if task.refetch {
            self.inner.observer.refresh(&task.key).await
        } else {
            Ok(self.inner.observer.get(&task.key).await)
        }
    }

    async fn on_failure(
        &self,
        mut task: ReconciliationTask,
        err: ApplyError,
        summary: Option<DiffSummary>,
    ) -> TaskOutcome {
        let message = err.to_string();
        match err {
            ApplyError::Conflict(_)
                if self.inner.config.retry.absorbs_conflict(task.conflicts + 1) =>
            {
                task.conflicts += 1;
                task.refetch = true;
                task.trigger = Trigger::Conflict;
                let conflicts = task.conflicts;
                debug!(key = %task.key, conflicts, error = %message, "Version conflict, re-reading");
                self.inner.queue.enqueue(task).await;
                TaskOutcome::Conflict { conflicts }
            }
            ApplyError::Conflict(_) | ApplyError::Transient(_) => {
                let attempts = task.attempts + 1;
                match self.inner.config.retry.after_failure(attempts) {
                    RetryDecision::Retry { delay } => {
                        warn!(
                            key = %task.key,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Apply failed, retrying"
                        );
                        let mut update = StatusUpdate::degraded(attempts, &message);
                        if let Some(summary) = summary {
                            update = update.with_diff(summary);
                        }
                        self.record(&task, update).await;

                        task.attempts = attempts;
                        task.conflicts = 0;
                        task.refetch = true;
                        task.trigger = Trigger::Retry;
                        self.inner.queue.enqueue_after(task, delay).await;
                        TaskOutcome::Retrying { attempts, delay }
                    }
                    RetryDecision::Exhausted => {
                        let err = ReconcileError::RetryBudgetExhausted {
                            attempts,
                            last_error: message,
                        };
                        self.fail(&task, attempts, err, summary).await
                    }
                }
            }
            ApplyError::Rejected(reason) => {
                let attempts = task.attempts + 1;
                self.fail(&task, attempts, ReconcileError::ValidationRejected(reason), summary)
                    .await
            }
        }
    }

    async fn fail(
        &self,
        task: &ReconciliationTask,
        attempts: u32,
        err: ReconcileError,
        summary: Option<DiffSummary>,
    ) -> TaskOutcome {
        error!(key = %task.key, generation = %task.generation, attempts, error = %err, "Reconciliation failed");
        let mut update = StatusUpdate::error(attempts, err.to_string());
        if let Some(summary) = summary {
            update = update.with_diff(summary);
        }
        self.record(task, update).await;
        TaskOutcome::Failed(err)
    }

    async fn record(&self, task: &ReconciliationTask, update: StatusUpdate) -> bool {
        self.inner
            .status
            .record(&task.key, task.generation, update)
            .await
    }

    /// Status of one key, for convenience.
    pub async fn status_of(&self, key: &ResourceKey) -> Option<ReconciliationStatus> {
        self.inner.status.get(key).await.map(|s| s.status)
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
