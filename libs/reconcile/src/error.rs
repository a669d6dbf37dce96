//! Reconciliation error taxonomy.

use steward_id::ResourceKey;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::desired::StoreError;

/// Reconciliation errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReconcileError {
    /// Network or timeout failure; retried with backoff.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// Optimistic concurrency violation; observed state is re-read and the
    /// diff recomputed.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// The live system rejected the desired specification. Never retried
    /// automatically.
    #[error("rejected: {0}")]
    ValidationRejected(String),

    /// The observer's resume token is no longer valid; a full listing is required.
    #[error("resync required: {0}")]
    ResyncRequired(String),

    /// Transient failures persisted through every allowed attempt.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted { attempts: u32, last_error: String },

    /// The desired-state store cannot be read; reconciliation is paused.
    #[error("desired-state store unavailable: {0}")]
    StoreUnavailable(String),

    /// The resource is not declared in desired state.
    #[error("resource not declared: {0}")]
    NotDeclared(ResourceKey),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Returns true if the error is recovered locally by retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReconcileError::TransientIo(_) | ReconcileError::VersionConflict(_)
        )
    }
}

impl From<ClusterError> for ReconcileError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Unavailable(_) | ClusterError::Timeout(_) => {
                ReconcileError::TransientIo(err.to_string())
            }
            ClusterError::Conflict { .. }
            | ClusterError::AlreadyExists { .. }
            | ClusterError::NotFound => ReconcileError::VersionConflict(err.to_string()),
            ClusterError::Invalid(_) | ClusterError::Forbidden(_) => {
                ReconcileError::ValidationRejected(err.to_string())
            }
            ClusterError::Expired { .. } => ReconcileError::ResyncRequired(err.to_string()),
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => ReconcileError::StoreUnavailable(message),
            StoreError::Expired(_) => ReconcileError::ResyncRequired(err.to_string()),
        }
    }
}
