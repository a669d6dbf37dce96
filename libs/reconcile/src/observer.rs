//! Live-state observer.
//!
//! Follows the live system's change stream from the last acknowledged
//! [`ResumeToken`] and keeps a cache of observed resources:
//!
//! - Events for a key are applied in resource-version order; older versions are
//!   dropped and equal versions are duplicate no-ops
//! - A failed poll leaves the cursor where it was, so the next poll resumes
//!   from the last acknowledged token
//! - An expired token triggers a full listing that replaces the cache

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use steward_id::{ResourceKey, ResourceVersion};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, ClusterError, ObservedChange, ObservedResource, ResumeToken};
use crate::error::ReconcileError;

/// Checkpoint for a change stream.
///
/// Tracks the last acknowledged token for resumable consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Last acknowledged token.
    pub token: ResumeToken,

    /// Timestamp of last checkpoint update.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// Create a new checkpoint.
    pub fn new(token: ResumeToken) -> Self {
        Self {
            token,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Check if a position has already been acknowledged.
    pub fn is_processed(&self, token: ResumeToken) -> bool {
        token <= self.token
    }

    /// Advance the checkpoint. Never moves backwards.
    pub fn advance(&mut self, token: ResumeToken) {
        if token > self.token {
            self.token = token;
            self.updated_at = chrono::Utc::now();
        }
    }

    /// Jump to a token from a fresh listing, even if it is lower.
    pub fn reset(&mut self, token: ResumeToken) {
        self.token = token;
        self.updated_at = chrono::Utc::now();
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new(ResumeToken::START)
    }
}

/// Result of a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// Keys whose observed state changed. Duplicates and stale events are omitted.
    Changed(Vec<ResourceKey>),

    /// The stream had to be rebuilt from a full listing. Every key the
    /// observer knows about (before or after) is included.
    Resynced(Vec<ResourceKey>),
}

impl ObserveOutcome {
    pub fn keys(&self) -> &[ResourceKey] {
        match self {
            ObserveOutcome::Changed(keys) | ObserveOutcome::Resynced(keys) => keys,
        }
    }
}

#[derive(Debug, Default)]
struct ObservedState {
    resources: BTreeMap<ResourceKey, ObservedResource>,

    /// Highest version seen per key, including deletions.
    versions: BTreeMap<ResourceKey, ResourceVersion>,

    checkpoint: Checkpoint,
}

impl ObservedState {
    /// Applies one observation. Returns true if it changed the cache.
    fn observe(&mut self, key: &ResourceKey, version: ResourceVersion, change: ObservedChange) -> bool {
        if let Some(seen) = self.versions.get(key) {
            if version <= *seen {
                return false;
            }
        }
        self.versions.insert(key.clone(), version);

        match change {
            ObservedChange::Applied(spec) => {
                self.resources.insert(
                    key.clone(),
                    ObservedResource {
                        key: key.clone(),
                        spec,
                        version,
                    },
                );
            }
            ObservedChange::Deleted => {
                self.resources.remove(key);
            }
        }
        true
    }
}

/// Live-state observer.
pub struct Observer {
    api: Arc<dyn ClusterApi>,
    batch_size: usize,
    state: RwLock<ObservedState>,
}

impl Observer {
    /// Create a new observer. Call [`Observer::resync`] before polling.
    pub fn new(api: Arc<dyn ClusterApi>, batch_size: usize) -> Self {
        Self {
            api,
            batch_size: batch_size.max(1),
            state: RwLock::new(ObservedState::default()),
        }
    }

    /// Replace the cache with a full listing of the live system.
    ///
    /// Returns every key present before or after the listing.
    pub async fn resync(&self) -> Result<Vec<ResourceKey>, ReconcileError> {
        let snapshot = self.api.list().await?;

        let mut state = self.state.write().await;
        let mut keys: BTreeSet<ResourceKey> = state.resources.keys().cloned().collect();

        let mut resources = BTreeMap::new();
        for resource in snapshot.resources {
            keys.insert(resource.key.clone());
            let seen = state.versions.entry(resource.key.clone()).or_default();
            if resource.version > *seen {
                *seen = resource.version;
            }
            resources.insert(resource.key.clone(), resource);
        }
        state.resources = resources;
        state.checkpoint.reset(snapshot.token);

        info!(
            resources = state.resources.len(),
            token = %snapshot.token,
            "Observed state resynchronized"
        );

        Ok(keys.into_iter().collect())
    }

    /// Fetch the next batch of changes.
    ///
    /// Transient failures are returned as errors without moving the cursor.
    /// An expired token falls back to [`Observer::resync`].
    pub async fn poll(&self) -> Result<ObserveOutcome, ReconcileError> {
        let after = self.state.read().await.checkpoint.token;

        let batch = match self.api.watch(after, self.batch_size).await {
            Ok(batch) => batch,
            Err(ClusterError::Expired { token, oldest }) => {
                warn!(
                    token = %token,
                    oldest = %oldest,
                    "Watch resume token expired, falling back to full resync"
                );
                return self.resync().await.map(ObserveOutcome::Resynced);
            }
            Err(e) => return Err(e.into()),
        };

        let mut state = self.state.write().await;
        if state.checkpoint.token != after {
            // A resync ran concurrently; this batch is relative to a stale cursor.
            debug!(after = %after, "Discarding watch batch after concurrent resync");
            return Ok(ObserveOutcome::Changed(Vec::new()));
        }

        let mut changed = BTreeSet::new();
        for event in batch.events {
            if state.observe(&event.key, event.version, event.change) {
                changed.insert(event.key);
            } else {
                debug!(
                    key = %event.key,
                    version = %event.version,
                    "Skipping duplicate or stale observation"
                );
            }
        }
        state.checkpoint.advance(batch.next);

        Ok(ObserveOutcome::Changed(changed.into_iter().collect()))
    }

    /// Re-read a single resource from the live system and update the cache.
    pub async fn refresh(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, ReconcileError> {
        let fetched = self.api.get(key).await?;

        let mut state = self.state.write().await;
        match fetched {
            Some(resource) => {
                state.observe(key, resource.version, ObservedChange::Applied(resource.spec));
            }
            None => {
                // Deletion version unknown; the watch stream will catch up.
                state.resources.remove(key);
            }
        }
        Ok(state.resources.get(key).cloned())
    }

    /// Cached observed state of one resource.
    pub async fn get(&self, key: &ResourceKey) -> Option<ObservedResource> {
        self.state.read().await.resources.get(key).cloned()
    }

    /// Keys currently observed.
    pub async fn keys(&self) -> Vec<ResourceKey> {
        self.state.read().await.resources.keys().cloned().collect()
    }

    /// Last acknowledged resume token.
    pub async fn checkpoint(&self) -> Checkpoint {
        self.state.read().await.checkpoint.clone()
    }
}
