//! Desired-state store contract.
//!
//! The store is read-only from the controller's perspective. It supports a
//! full listing (for resync) and an incremental change feed addressed by
//! [`ResumeToken`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use steward_id::{Generation, ResourceKey};
use thiserror::Error;

use crate::cluster::ResumeToken;
use crate::diff::Ownership;

/// Declared target configuration of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredResource {
    pub key: ResourceKey,
    pub spec: Value,
    pub generation: Generation,
    pub ownership: Ownership,

    /// Apply diffs automatically. When false, drift is only reported.
    pub auto_sync: bool,
}

/// A change in desired state.
#[derive(Debug, Clone, PartialEq)]
pub enum DesiredChange {
    /// The resource was declared or its declaration changed.
    Upserted(DesiredResource),

    /// The resource is no longer declared. `generation` is the bumped
    /// generation marking the removal.
    Removed {
        key: ResourceKey,
        generation: Generation,
    },
}

impl DesiredChange {
    pub fn key(&self) -> &ResourceKey {
        match self {
            DesiredChange::Upserted(resource) => &resource.key,
            DesiredChange::Removed { key, .. } => key,
        }
    }

    pub fn generation(&self) -> Generation {
        match self {
            DesiredChange::Upserted(resource) => resource.generation,
            DesiredChange::Removed { generation, .. } => *generation,
        }
    }
}

/// Every declared resource plus the token to follow changes from.
#[derive(Debug, Clone, Default)]
pub struct DesiredSnapshot {
    pub resources: Vec<DesiredResource>,
    pub token: ResumeToken,
}

/// Changes after a token.
#[derive(Debug, Clone, Default)]
pub struct DesiredBatch {
    pub changes: Vec<DesiredChange>,
    pub next: ResumeToken,
}

/// Errors reported by a desired-state store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// The store cannot be read at all.
    #[error("desired-state store unavailable: {0}")]
    Unavailable(String),

    /// The change feed no longer covers the given token.
    #[error("desired-state token {0} expired")]
    Expired(ResumeToken),
}

/// Source of declared resources.
#[async_trait]
pub trait DesiredStateStore: Send + Sync {
    /// List every declared resource.
    async fn list(&self) -> Result<DesiredSnapshot, StoreError>;

    /// Return up to `limit` changes after `after`.
    async fn changes(&self, after: ResumeToken, limit: usize) -> Result<DesiredBatch, StoreError>;
}
