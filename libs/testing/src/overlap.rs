use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use steward_id::ResourceKey;
use tracing::warn;

#[derive(Debug, Default)]
struct TrackerState {
    active: BTreeMap<ResourceKey, usize>,
    total_active: usize,
    max_total: usize,
    max_per_key: usize,
    overlaps: usize,
    entries: usize,
}

/// Records concurrent operations per key.
///
/// Every operation holds an [`OverlapGuard`] for its duration. Two guards for
/// the same key alive at once count as an overlap.
#[derive(Debug, Clone, Default)]
pub struct OverlapTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl OverlapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the start of an operation on `key`.
    pub fn enter(&self, key: &ResourceKey) -> OverlapGuard {
        let mut state = self.lock();

        let active = state.active.entry(key.clone()).or_default();
        *active += 1;
        let active = *active;
        if active > 1 {
            warn!(key = %key, active, "Overlapping operations on one key");
            state.overlaps += 1;
        }
        state.max_per_key = state.max_per_key.max(active);
        state.total_active += 1;
        state.max_total = state.max_total.max(state.total_active);
        state.entries += 1;

        OverlapGuard {
            tracker: self.clone(),
            key: key.clone(),
        }
    }

    fn exit(&self, key: &ResourceKey) {
        let mut state = self.lock();
        if let Some(active) = state.active.get_mut(key) {
            *active -= 1;
            if *active == 0 {
                state.active.remove(key);
            }
        }
        state.total_active = state.total_active.saturating_sub(1);
    }

    /// Number of times an operation started while another on the same key was running.
    pub fn overlaps(&self) -> usize {
        self.lock().overlaps
    }

    /// Highest number of operations running at once across all keys.
    pub fn max_concurrency(&self) -> usize {
        self.lock().max_total
    }

    /// Highest number of operations running at once on a single key.
    pub fn max_per_key(&self) -> usize {
        self.lock().max_per_key
    }

    /// Total operations observed.
    pub fn entries(&self) -> usize {
        self.lock().entries
    }
}

/// Held for the duration of one tracked operation.
#[derive(Debug)]
pub struct OverlapGuard {
    tracker: OverlapTracker,
    key: ResourceKey,
}

impl Drop for OverlapGuard {
    fn drop(&mut self) {
        self.tracker.exit(&self.key);
    }
}
