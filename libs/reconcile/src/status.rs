//! Status reporter.
//!
//! Records the reconciliation outcome per resource for external observation.
//! Updates are last-write-wins keyed by `(key, generation)`: an update carrying
//! an older generation than the recorded one is discarded, so a superseded
//! in-flight task can never overwrite the status of a newer generation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use steward_id::{Generation, ResourceKey};
use tokio::sync::RwLock;
use tracing::debug;

use crate::diff::DiffSummary;

/// Reconciliation status of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    /// A task is queued for the current generation.
    Pending,

    /// A worker is diffing or applying.
    Syncing,

    /// Observed matches desired.
    Synced,

    /// Drift detected and auto-sync is off.
    OutOfSync,

    /// Apply failed with a retryable error; a retry is scheduled.
    Degraded,

    /// Terminal failure; needs a new generation or an operator retry.
    Error,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Pending => "pending",
            ReconciliationStatus::Syncing => "syncing",
            ReconciliationStatus::Synced => "synced",
            ReconciliationStatus::OutOfSync => "out_of_sync",
            ReconciliationStatus::Degraded => "degraded",
            ReconciliationStatus::Error => "error",
        }
    }

    /// Returns true if automatic reconciliation has stopped for this generation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReconciliationStatus::Error)
    }
}

impl std::fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one resource as seen by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub key: ResourceKey,
    pub status: ReconciliationStatus,
    pub generation: Generation,

    /// Summary of the most recent diff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffSummary>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Consecutive failed apply attempts for this generation.
    pub attempts: u32,

    pub updated_at: DateTime<Utc>,
}

/// A status transition to record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: ReconciliationStatus,
    pub diff: Option<DiffSummary>,
    pub message: Option<String>,
    pub attempts: u32,
}

impl StatusUpdate {
    fn new(status: ReconciliationStatus) -> Self {
        Self {
            status,
            diff: None,
            message: None,
            attempts: 0,
        }
    }

    pub fn pending() -> Self {
        Self::new(ReconciliationStatus::Pending)
    }

    pub fn syncing(attempts: u32) -> Self {
        Self::new(ReconciliationStatus::Syncing).with_attempts(attempts)
    }

    pub fn synced() -> Self {
        Self::new(ReconciliationStatus::Synced).with_diff(DiffSummary::default())
    }

    pub fn out_of_sync(diff: DiffSummary) -> Self {
        Self::new(ReconciliationStatus::OutOfSync).with_diff(diff)
    }

    pub fn degraded(attempts: u32, message: impl Into<String>) -> Self {
        Self::new(ReconciliationStatus::Degraded)
            .with_attempts(attempts)
            .with_message(message)
    }

    pub fn error(attempts: u32, message: impl Into<String>) -> Self {
        Self::new(ReconciliationStatus::Error)
            .with_attempts(attempts)
            .with_message(message)
    }

    pub fn with_diff(mut self, diff: DiffSummary) -> Self {
        self.diff = Some(diff);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Process-wide condition, independent of individual resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessCondition {
    Healthy,

    /// Reconciliation is paused because of a systemic failure.
    Degraded {
        message: String,
        since: DateTime<Utc>,
    },
}

impl ProcessCondition {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProcessCondition::Healthy)
    }
}

/// Counts of resources per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: usize,
    pub by_status: BTreeMap<ReconciliationStatus, usize>,
}

impl StatusSummary {
    pub fn count(&self, status: ReconciliationStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Board {
    entries: BTreeMap<ResourceKey, ResourceStatus>,

    /// Generation at which a key was forgotten; older updates are discarded.
    tombstones: BTreeMap<ResourceKey, Generation>,

    condition: ProcessCondition,
}

/// Shared, queryable status store.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    inner: Arc<RwLock<Board>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Board {
                entries: BTreeMap::new(),
                tombstones: BTreeMap::new(),
                condition: ProcessCondition::Healthy,
            })),
        }
    }

    /// Record an update for `(key, generation)`.
    ///
    /// Returns false if the update was discarded because a newer generation
    /// has already been recorded for the key.
    pub async fn record(&self, key: &ResourceKey, generation: Generation, update: StatusUpdate) -> bool {
        let mut board = self.inner.write().await;

        if let Some(forgotten) = board.tombstones.get(key) {
            if generation <= *forgotten {
                debug!(key = %key, generation = %generation, "Discarding status for forgotten resource");
                return false;
            }
        }
        if let Some(current) = board.entries.get(key) {
            if generation < current.generation {
                debug!(
                    key = %key,
                    generation = %generation,
                    current = %current.generation,
                    "Discarding status update for superseded generation"
                );
                return false;
            }
        }

        board.tombstones.remove(key);
        board.entries.insert(
            key.clone(),
            ResourceStatus {
                key: key.clone(),
                status: update.status,
                generation,
                diff: update.diff,
                message: update.message,
                attempts: update.attempts,
                updated_at: Utc::now(),
            },
        );
        true
    }

    /// Forget a resource. Updates at or below `generation` are discarded afterwards.
    pub async fn forget(&self, key: &ResourceKey, generation: Generation) {
        let mut board = self.inner.write().await;
        board.entries.remove(key);
        board.tombstones.insert(key.clone(), generation);
    }

    pub async fn get(&self, key: &ResourceKey) -> Option<ResourceStatus> {
        self.inner.read().await.entries.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<ResourceStatus> {
        self.inner.read().await.entries.values().cloned().collect()
    }

    pub async fn summary(&self) -> StatusSummary {
        let board = self.inner.read().await;
        let mut summary = StatusSummary {
            total: board.entries.len(),
            ..StatusSummary::default()
        };
        for entry in board.entries.values() {
            *summary.by_status.entry(entry.status).or_default() += 1;
        }
        summary
    }

    pub async fn condition(&self) -> ProcessCondition {
        self.inner.read().await.condition.clone()
    }

    /// Mark the whole process degraded. Keeps the original `since` if already degraded.
    pub async fn set_degraded(&self, message: impl Into<String>) {
        let mut board = self.inner.write().await;
        let message = message.into();
        board.condition = match &board.condition {
            ProcessCondition::Degraded { since, .. } => ProcessCondition::Degraded {
                message,
                since: *since,
            },
            ProcessCondition::Healthy => ProcessCondition::Degraded {
                message,
                since: Utc::now(),
            },
        };
    }

    pub async fn set_healthy(&self) {
        self.inner.write().await.condition = ProcessCondition::Healthy;
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
