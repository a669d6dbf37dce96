//! Work queue of reconciliation tasks.
//!
//! Holds at most one pending task per key. When tasks for the same key meet,
//! only the highest generation survives; lower generations are dropped without
//! executing. Backoff is a not-before instant on the pending entry, so
//! replacing or cancelling the entry also cancels the backoff.
//!
//! A key handed to a worker stays in flight until [`WorkQueue::complete`], and
//! no second task for it is handed out in the meantime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use steward_id::{Generation, ResourceKey};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

/// Why a task was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    DesiredChanged,
    Drift,
    Resync,
    Retry,
    Conflict,
    Operator,
    Removed,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::DesiredChanged => "desired_changed",
            Trigger::Drift => "drift",
            Trigger::Resync => "resync",
            Trigger::Retry => "retry",
            Trigger::Conflict => "conflict",
            Trigger::Operator => "operator",
            Trigger::Removed => "removed",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the task converges the key towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Make the live resource match its declaration.
    Apply,

    /// Remove a resource that is no longer declared.
    Delete,
}

/// A unit of reconciliation work for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationTask {
    pub key: ResourceKey,

    /// Desired generation at enqueue time.
    pub generation: Generation,

    /// Failed apply attempts for this generation so far.
    pub attempts: u32,

    /// Consecutive version conflicts.
    pub conflicts: u32,

    /// Re-read observed state from the live system before diffing.
    pub refetch: bool,

    pub trigger: Trigger,
    pub intent: Intent,
}

impl ReconciliationTask {
    pub fn new(key: ResourceKey, generation: Generation, trigger: Trigger) -> Self {
        Self {
            key,
            generation,
            attempts: 0,
            conflicts: 0,
            refetch: false,
            trigger,
            intent: Intent::Apply,
        }
    }

    pub fn deletion(key: ResourceKey, generation: Generation) -> Self {
        Self {
            intent: Intent::Delete,
            ..Self::new(key, generation, Trigger::Removed)
        }
    }
}

#[derive(Debug)]
struct Queued {
    task: ReconciliationTask,
    not_before: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeMap<ResourceKey, Queued>,
    in_flight: BTreeMap<ResourceKey, Generation>,

    /// Highest generation ever enqueued or cancelled per key.
    latest: BTreeMap<ResourceKey, Generation>,

    paused: bool,
}

enum Poll {
    Ready(ReconciliationTask),
    Wait(Option<Instant>),
}

impl QueueState {
    fn poll(&mut self, now: Instant) -> Poll {
        if self.paused {
            return Poll::Wait(None);
        }

        let mut ready: Option<(&ResourceKey, Instant)> = None;
        let mut wake: Option<Instant> = None;
        for (key, queued) in &self.pending {
            if self.in_flight.contains_key(key) {
                continue;
            }
            if queued.not_before <= now {
                if ready.is_none_or(|(_, at)| queued.not_before < at) {
                    ready = Some((key, queued.not_before));
                }
            } else if wake.is_none_or(|at| queued.not_before < at) {
                wake = Some(queued.not_before);
            }
        }

        let Some((key, _)) = ready else {
            return Poll::Wait(wake);
        };
        let key = key.clone();
        match self.pending.remove(&key) {
            Some(queued) => {
                self.in_flight.insert(key, queued.task.generation);
                Poll::Ready(queued.task)
            }
            None => Poll::Wait(wake),
        }
    }
}

/// Shared queue of reconciliation tasks.
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task that is ready immediately.
    ///
    /// Returns false if the task was dropped because a newer generation is
    /// already known for the key.
    pub async fn enqueue(&self, task: ReconciliationTask) -> bool {
        self.enqueue_after(task, Duration::ZERO).await
    }

    /// Enqueue a task that becomes ready after `delay`.
    pub async fn enqueue_after(&self, task: ReconciliationTask, delay: Duration) -> bool {
        let not_before = Instant::now() + delay;
        let mut state = self.state.lock().await;

        let latest = state.latest.get(&task.key).copied().unwrap_or_default();
        if task.generation < latest {
            debug!(
                key = %task.key,
                generation = %task.generation,
                latest = %latest,
                "Dropping task for superseded generation"
            );
            return false;
        }
        state.latest.insert(task.key.clone(), task.generation);

        let key = task.key.clone();
        match state.pending.get_mut(&key) {
            Some(queued) if queued.task.generation == task.generation => {
                if task.trigger == Trigger::Operator {
                    *queued = Queued { task, not_before };
                } else {
                    // Same generation: keep the larger budget usage and never
                    // shorten an existing backoff.
                    queued.task.attempts = queued.task.attempts.max(task.attempts);
                    queued.task.conflicts = queued.task.conflicts.max(task.conflicts);
                    queued.task.refetch |= task.refetch;
                    queued.not_before = queued.not_before.max(not_before);
                }
            }
            Some(queued) => {
                debug!(
                    key = %key,
                    replaced = %queued.task.generation,
                    generation = %task.generation,
                    "Replacing queued task with newer generation"
                );
                *queued = Queued { task, not_before };
            }
            None => {
                state.pending.insert(key, Queued { task, not_before });
            }
        }
        drop(state);

        self.notify.notify_waiters();
        true
    }

    /// Take the next ready task without waiting.
    pub async fn try_next(&self) -> Option<ReconciliationTask> {
        match self.state.lock().await.poll(Instant::now()) {
            Poll::Ready(task) => Some(task),
            Poll::Wait(_) => None,
        }
    }

    /// Wait for the next ready task. Returns `None` on shutdown.
    pub async fn next(&self, shutdown: &mut watch::Receiver<bool>) -> Option<ReconciliationTask> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = match self.state.lock().await.poll(Instant::now()) {
                Poll::Ready(task) => return Some(task),
                Poll::Wait(wake) => wake,
            };

            let sleep = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
            }
        }
    }

    /// Release a key after its task finished.
    pub async fn complete(&self, key: &ResourceKey, generation: Generation) {
        let mut state = self.state.lock().await;
        if state.in_flight.get(key) == Some(&generation) {
            state.in_flight.remove(key);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Drop any pending task for `key` older than `generation` and mark
    /// in-flight work below it as superseded.
    pub async fn cancel(&self, key: &ResourceKey, generation: Generation) -> bool {
        let mut state = self.state.lock().await;

        let latest = state.latest.entry(key.clone()).or_default();
        if generation > *latest {
            *latest = generation;
        }

        let stale = state
            .pending
            .get(key)
            .is_some_and(|queued| queued.task.generation < generation);
        if stale {
            state.pending.remove(key);
            debug!(key = %key, generation = %generation, "Cancelled queued task");
        }
        stale
    }

    /// Returns true if a newer generation than `generation` exists for `key`.
    pub async fn is_superseded(&self, key: &ResourceKey, generation: Generation) -> bool {
        self.state
            .lock()
            .await
            .latest
            .get(key)
            .is_some_and(|latest| *latest > generation)
    }

    /// Stop handing out tasks. In-flight tasks are unaffected.
    pub async fn pause(&self) {
        self.state.lock().await.paused = true;
    }

    pub async fn resume(&self) {
        self.state.lock().await.paused = false;
        self.notify.notify_waiters();
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    /// Generation of the pending task for `key`, if any.
    pub async fn pending_generation(&self, key: &ResourceKey) -> Option<Generation> {
        self.state
            .lock()
            .await
            .pending
            .get(key)
            .map(|queued| queued.task.generation)
    }

    /// Number of pending tasks.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Returns true if nothing is pending or in flight.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.pending.is_empty() && state.in_flight.is_empty()
    }
}
