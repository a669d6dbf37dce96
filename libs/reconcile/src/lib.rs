//! Reconciliation engine.
//!
//! This library drives an external system's observed state toward a declared
//! desired state. Key concepts:
//!
//! - **Desired state**: What the system should look like (from a [`DesiredStateStore`]).
//! - **Observed state**: What the system actually looks like (from a [`ClusterApi`]).
//! - **Convergence**: Diffing the two per resource and applying the difference.
//!
//! # Invariants
//!
//! - At most one task per resource key is in flight at any time
//! - Generations only move forward; a task for an older generation never wins
//! - Applying the same diff twice has the same effect as applying it once
//! - A resource is reported `Synced` only when its latest diff was empty

pub mod cluster;
pub mod desired;
pub mod diff;
pub mod document;
pub mod error;
pub mod executor;
pub mod kind;
pub mod memory;
pub mod observer;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod status;

pub use cluster::{
    ClusterApi, ClusterError, ClusterSnapshot, ObservedChange, ObservedResource, Operation,
    ResumeToken, WatchBatch, WatchEvent,
};
pub use desired::{
    DesiredBatch, DesiredChange, DesiredResource, DesiredSnapshot, DesiredStateStore, StoreError,
};
pub use diff::{diff, Change, Diff, DiffSummary, FieldOp, Ownership};
pub use document::{FieldPath, SpecHash};
pub use error::ReconcileError;
pub use executor::{ActionExecutor, ApplyError, ApplyOutcome};
pub use kind::KindCapabilities;
pub use memory::{MemoryCluster, MemoryDesiredStore};
pub use observer::{Checkpoint, ObserveOutcome, Observer};
pub use queue::{Intent, ReconciliationTask, Trigger, WorkQueue};
pub use reconciler::{Reconciler, ReconcilerConfig, TaskOutcome};
pub use retry::{BackoffPolicy, RetryDecision, RetryPolicy};
pub use status::{
    ProcessCondition, ReconciliationStatus, ResourceStatus, StatusBoard, StatusSummary,
    StatusUpdate,
};
