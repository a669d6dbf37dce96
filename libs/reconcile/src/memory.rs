//! In-memory live system and desired-state store.
//!
//! `MemoryCluster` behaves like a small API server: a global revision counter
//! doubles as resource version and watch position, history is retained for a
//! bounded number of events, specifications are validated per kind, and
//! writes are guarded by optimistic concurrency. It backs the controller's dev
//! mode and the test suites.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use steward_id::{Generation, ResourceKey, ResourceVersion};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cluster::{
    ClusterApi, ClusterError, ClusterSnapshot, ObservedChange, ObservedResource, Operation,
    ResumeToken, WatchBatch, WatchEvent,
};
use crate::desired::{
    DesiredBatch, DesiredChange, DesiredResource, DesiredSnapshot, DesiredStateStore, StoreError,
};
use crate::diff::Ownership;
use crate::document;
use crate::kind::KindCapabilities;

/// Default number of retained change events.
pub const DEFAULT_RETENTION: usize = 1024;

/// Bounded change log addressed by sequence number.
#[derive(Debug)]
struct ChangeLog<T> {
    entries: VecDeque<(u64, T)>,
    retention: usize,

    /// Highest sequence number dropped from the log.
    compacted_through: u64,
}

impl<T: Clone> ChangeLog<T> {
    fn new(retention: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            retention: retention.max(1),
            compacted_through: 0,
        }
    }

    fn push(&mut self, sequence: u64, entry: T) {
        self.entries.push_back((sequence, entry));
        while self.entries.len() > self.retention {
            if let Some((dropped, _)) = self.entries.pop_front() {
                self.compacted_through = dropped;
            }
        }
    }

    fn compact(&mut self, through: u64) {
        self.entries.retain(|(seq, _)| *seq > through);
        self.compacted_through = self.compacted_through.max(through);
    }

    /// Entries after `after`, or `None` if some of them were compacted away.
    fn after(&self, after: u64, limit: usize) -> Option<Vec<(u64, T)>> {
        if after < self.compacted_through {
            return None;
        }
        Some(
            self.entries
                .iter()
                .filter(|(seq, _)| *seq > after)
                .take(limit)
                .cloned()
                .collect(),
        )
    }

    fn oldest(&self) -> u64 {
        self.compacted_through + 1
    }
}

// =============================================================================
// Live system
// =============================================================================

#[derive(Debug)]
struct ClusterState {
    resources: BTreeMap<ResourceKey, ObservedResource>,
    revision: u64,
    log: ChangeLog<WatchEvent>,
}

impl ClusterState {
    fn record(&mut self, key: &ResourceKey, change: ObservedChange) -> ResourceVersion {
        self.revision += 1;
        let version = ResourceVersion::new(self.revision);

        match &change {
            ObservedChange::Applied(spec) => {
                self.resources.insert(
                    key.clone(),
                    ObservedResource {
                        key: key.clone(),
                        spec: spec.clone(),
                        version,
                    },
                );
            }
            ObservedChange::Deleted => {
                self.resources.remove(key);
            }
        }

        self.log.push(
            self.revision,
            WatchEvent {
                key: key.clone(),
                change,
                version,
            },
        );
        version
    }
}

/// In-memory live system.
#[derive(Debug)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    /// Create an empty cluster with the default history retention.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create an empty cluster that keeps only the last `retention` events.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: Mutex::new(ClusterState {
                resources: BTreeMap::new(),
                revision: 0,
                log: ChangeLog::new(retention),
            }),
        }
    }

    /// Write a resource out-of-band, as another actor would. Bypasses validation.
    pub async fn put(&self, key: &ResourceKey, spec: Value) -> ResourceVersion {
        let mut state = self.state.lock().await;
        state.record(key, ObservedChange::Applied(spec))
    }

    /// Delete a resource out-of-band.
    pub async fn remove(&self, key: &ResourceKey) -> Option<ResourceVersion> {
        let mut state = self.state.lock().await;
        if !state.resources.contains_key(key) {
            return None;
        }
        Some(state.record(key, ObservedChange::Deleted))
    }

    /// Current specification of a resource.
    pub async fn spec(&self, key: &ResourceKey) -> Option<Value> {
        let state = self.state.lock().await;
        state.resources.get(key).map(|r| r.spec.clone())
    }

    /// Number of resources.
    pub async fn len(&self) -> usize {
        self.state.lock().await.resources.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop all retained history; every outstanding resume token expires.
    pub async fn compact(&self) {
        let mut state = self.state.lock().await;
        let revision = state.revision;
        state.log.compact(revision);
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn list(&self) -> Result<ClusterSnapshot, ClusterError> {
        let state = self.state.lock().await;
        Ok(ClusterSnapshot {
            resources: state.resources.values().cloned().collect(),
            token: ResumeToken::new(state.revision),
        })
    }

    async fn watch(&self, after: ResumeToken, limit: usize) -> Result<WatchBatch, ClusterError> {
        let state = self.state.lock().await;
        let Some(entries) = state.log.after(after.sequence(), limit) else {
            return Err(ClusterError::Expired {
                token: after,
                oldest: ResumeToken::new(state.log.oldest()),
            });
        };

        let next = entries
            .last()
            .map(|(seq, _)| ResumeToken::new(*seq))
            .unwrap_or(after);
        Ok(WatchBatch {
            events: entries.into_iter().map(|(_, event)| event).collect(),
            next,
        })
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, ClusterError> {
        let state = self.state.lock().await;
        Ok(state.resources.get(key).cloned())
    }

    async fn apply(
        &self,
        key: &ResourceKey,
        operation: &Operation,
        expected: Option<ResourceVersion>,
    ) -> Result<ResourceVersion, ClusterError> {
        let mut state = self.state.lock().await;
        let current = state.resources.get(key).map(|r| r.version);

        let version = match operation {
            Operation::Create { spec } => {
                if let Some(version) = current {
                    return Err(ClusterError::AlreadyExists { version });
                }
                key.kind.validate(spec).map_err(ClusterError::Invalid)?;
                state.record(key, ObservedChange::Applied(spec.clone()))
            }
            Operation::Patch { set, unset } => {
                let Some(existing) = state.resources.get(key) else {
                    return Err(ClusterError::NotFound);
                };
                if expected != current {
                    return Err(ClusterError::Conflict {
                        expected,
                        actual: current,
                    });
                }

                let mut spec = existing.spec.clone();
                for (path, value) in set {
                    document::set(&mut spec, path, value.clone());
                }
                for path in unset {
                    document::unset(&mut spec, path);
                }
                key.kind.validate(&spec).map_err(ClusterError::Invalid)?;
                state.record(key, ObservedChange::Applied(spec))
            }
            Operation::Delete => {
                if current.is_none() {
                    return Err(ClusterError::NotFound);
                }
                if expected.is_some() && expected != current {
                    return Err(ClusterError::Conflict {
                        expected,
                        actual: current,
                    });
                }
                state.record(key, ObservedChange::Deleted)
            }
        };

        debug!(key = %key, operation = operation.name(), version = %version, "Applied operation");
        Ok(version)
    }
}

// =============================================================================
// Desired-state store
// =============================================================================

#[derive(Debug)]
struct StoreState {
    resources: BTreeMap<ResourceKey, DesiredResource>,

    /// Last generation per key; survives removal so re-declaring keeps counting up.
    generations: BTreeMap<ResourceKey, Generation>,

    sequence: u64,
    log: ChangeLog<DesiredChange>,
}

impl StoreState {
    fn bump(&mut self, key: &ResourceKey) -> Generation {
        let generation = self.generations.get(key).copied().unwrap_or_default().next();
        self.generations.insert(key.clone(), generation);
        generation
    }

    fn record(&mut self, change: DesiredChange) {
        self.sequence += 1;
        self.log.push(self.sequence, change);
    }
}

/// In-memory desired-state store.
#[derive(Debug)]
pub struct MemoryDesiredStore {
    state: Mutex<StoreState>,
}

impl MemoryDesiredStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: Mutex::new(StoreState {
                resources: BTreeMap::new(),
                generations: BTreeMap::new(),
                sequence: 0,
                log: ChangeLog::new(retention),
            }),
        }
    }

    /// Declare a resource with partial ownership of no fields and auto-sync on.
    pub async fn declare(&self, key: &ResourceKey, spec: Value) -> Generation {
        self.declare_with(key, spec, Ownership::none(), true).await
    }

    /// Declare a resource. The generation only moves when something changed.
    pub async fn declare_with(
        &self,
        key: &ResourceKey,
        spec: Value,
        ownership: Ownership,
        auto_sync: bool,
    ) -> Generation {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.resources.get(key) {
            if existing.spec == spec
                && existing.ownership == ownership
                && existing.auto_sync == auto_sync
            {
                return existing.generation;
            }
        }

        let generation = state.bump(key);
        let resource = DesiredResource {
            key: key.clone(),
            spec,
            generation,
            ownership,
            auto_sync,
        };
        state.resources.insert(key.clone(), resource.clone());
        state.record(DesiredChange::Upserted(resource));
        generation
    }

    /// Stop declaring a resource. Returns the removal generation.
    pub async fn remove(&self, key: &ResourceKey) -> Option<Generation> {
        let mut state = self.state.lock().await;
        state.resources.remove(key)?;

        let generation = state.bump(key);
        state.record(DesiredChange::Removed {
            key: key.clone(),
            generation,
        });
        Some(generation)
    }

    pub async fn get(&self, key: &ResourceKey) -> Option<DesiredResource> {
        self.state.lock().await.resources.get(key).cloned()
    }

    /// Drop the change history; outstanding tokens expire.
    pub async fn compact(&self) {
        let mut state = self.state.lock().await;
        let sequence = state.sequence;
        state.log.compact(sequence);
    }
}

impl Default for MemoryDesiredStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DesiredStateStore for MemoryDesiredStore {
    async fn list(&self) -> Result<DesiredSnapshot, StoreError> {
        let state = self.state.lock().await;
        Ok(DesiredSnapshot {
            resources: state.resources.values().cloned().collect(),
            token: ResumeToken::new(state.sequence),
        })
    }

    async fn changes(&self, after: ResumeToken, limit: usize) -> Result<DesiredBatch, StoreError> {
        let state = self.state.lock().await;
        let entries = state
            .log
            .after(after.sequence(), limit)
            .ok_or(StoreError::Expired(after))?;

        let next = entries
            .last()
            .map(|(seq, _)| ResumeToken::new(*seq))
            .unwrap_or(after);
        Ok(DesiredBatch {
            changes: entries.into_iter().map(|(_, change)| change).collect(),
            next,
        })
    }
}
