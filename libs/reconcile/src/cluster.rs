//! Contract of the live system the controller drives.
//!
//! The live system is a black box: it can enumerate resources, stream
//! changes from a resume token, fetch a single resource, and apply one
//! operation guarded by an expected resource version.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use steward_id::{ResourceKey, ResourceVersion};
use thiserror::Error;

use crate::document::FieldPath;

/// Opaque cursor into a change stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(u64);

impl ResumeToken {
    /// Token positioned before the first change.
    pub const START: Self = Self(0);

    pub const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub const fn sequence(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resource as currently observed in the live system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedResource {
    pub key: ResourceKey,
    pub spec: Value,
    pub version: ResourceVersion,
}

/// What happened to a resource in a watch event.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedChange {
    Applied(Value),
    Deleted,
}

/// One entry in the live system's change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub key: ResourceKey,
    pub change: ObservedChange,
    pub version: ResourceVersion,
}

/// A batch of watch events plus the token to resume after them.
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
    pub next: ResumeToken,
}

/// Full enumeration of the live system.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub resources: Vec<ObservedResource>,

    /// Watching from this token yields only changes after the snapshot.
    pub token: ResumeToken,
}

/// A single mutation sent to the live system.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Create the resource with this full specification.
    Create { spec: Value },

    /// Set and remove individual fields.
    Patch {
        set: Vec<(FieldPath, Value)>,
        unset: Vec<FieldPath>,
    },

    /// Delete the resource.
    Delete,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Patch { .. } => "patch",
            Operation::Delete => "delete",
        }
    }
}

/// Errors reported by the live system.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClusterError {
    /// The live system could not be reached.
    #[error("live system unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The resource version moved since it was read.
    #[error("version conflict: expected {expected:?}, found {actual:?}")]
    Conflict {
        expected: Option<ResourceVersion>,
        actual: Option<ResourceVersion>,
    },

    /// Create was called for a resource that already exists.
    #[error("resource already exists at version {version}")]
    AlreadyExists { version: ResourceVersion },

    /// The resource does not exist.
    #[error("resource not found")]
    NotFound,

    /// The live system rejected the specification.
    #[error("invalid specification: {0}")]
    Invalid(String),

    /// The caller may not perform this operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The resume token is older than the retained history.
    #[error("resume token {token} expired (oldest retained is {oldest})")]
    Expired {
        token: ResumeToken,
        oldest: ResumeToken,
    },
}

impl ClusterError {
    /// Returns true for network-level failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Unavailable(_) | ClusterError::Timeout(_))
    }
}

/// Interface to the live system.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Enumerate every managed resource.
    async fn list(&self) -> Result<ClusterSnapshot, ClusterError>;

    /// Return up to `limit` changes after `after`, in order.
    async fn watch(&self, after: ResumeToken, limit: usize) -> Result<WatchBatch, ClusterError>;

    /// Fetch the current state of one resource.
    async fn get(&self, key: &ResourceKey) -> Result<Option<ObservedResource>, ClusterError>;

    /// Apply one operation, guarded by the version read at diff time.
    async fn apply(
        &self,
        key: &ResourceKey,
        operation: &Operation,
        expected: Option<ResourceVersion>,
    ) -> Result<ResourceVersion, ClusterError>;
}
