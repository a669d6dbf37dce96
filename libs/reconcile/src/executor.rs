//! Action executor.
//!
//! Turns a [`Diff`] into exactly one operation against the live system and
//! classifies the result. Re-applying a diff after a crash is safe: a create
//! that finds the resource already in the desired shape, or a delete that
//! finds nothing, counts as success.

use std::sync::Arc;

use steward_id::{ResourceKey, ResourceVersion};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, ClusterError, Operation};
use crate::desired::DesiredResource;
use crate::diff::{self, Change, Diff};

/// Successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation was performed; the live system is now at `version`.
    Applied { version: ResourceVersion },

    /// The live system already matched; nothing was written.
    AlreadyConverged,
}

/// Failed apply, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// Network, timeout or availability failure.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The resource changed since it was observed; re-diff before retrying.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Validation rejection or forbidden; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApplyError::Rejected(_))
    }
}

/// Translate a diff into the single operation that realizes it.
///
/// Returns `None` for an empty diff.
pub fn plan(diff: &Diff) -> Option<Operation> {
    if diff.is_empty() {
        return None;
    }
    if let Some(spec) = diff.creation() {
        return Some(Operation::Create { spec: spec.clone() });
    }
    if diff.is_deletion() {
        return Some(Operation::Delete);
    }

    let mut set = Vec::new();
    let mut unset = Vec::new();
    for op in diff.ops() {
        match &op.change {
            Change::Add { value } | Change::Modify { to: value, .. } => {
                set.push((op.path.clone(), value.clone()));
            }
            Change::Remove { .. } => unset.push(op.path.clone()),
        }
    }
    Some(Operation::Patch { set, unset })
}

/// Applies diffs against the live system.
#[derive(Clone)]
pub struct ActionExecutor {
    api: Arc<dyn ClusterApi>,
}

impl ActionExecutor {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Apply `diff` to `key`, guarded by the version read at diff time.
    ///
    /// `desired` is used to recognize an already-converged resource when a
    /// create collides with an existing one; pass `None` for deletions.
    pub async fn apply(
        &self,
        key: &ResourceKey,
        diff: &Diff,
        desired: Option<&DesiredResource>,
        expected: Option<ResourceVersion>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let Some(operation) = plan(diff) else {
            return Ok(ApplyOutcome::AlreadyConverged);
        };

        debug!(
            key = %key,
            operation = operation.name(),
            changes = diff.len(),
            expected = ?expected.map(|v| v.get()),
            "Applying diff"
        );

        match self.api.apply(key, &operation, expected).await {
            Ok(version) => {
                info!(key = %key, operation = operation.name(), version = %version, "Applied");
                Ok(ApplyOutcome::Applied { version })
            }
            Err(ClusterError::AlreadyExists { version }) => {
                self.resolve_existing(key, desired, version).await
            }
            Err(ClusterError::NotFound) if matches!(operation, Operation::Delete) => {
                debug!(key = %key, "Resource already absent");
                Ok(ApplyOutcome::AlreadyConverged)
            }
            Err(ClusterError::NotFound) => Err(ApplyError::Conflict(format!(
                "{key} disappeared before {} could be applied",
                operation.name()
            ))),
            Err(err) => Err(classify(err)),
        }
    }

    /// A create hit an existing resource: success if it already matches desired.
    async fn resolve_existing(
        &self,
        key: &ResourceKey,
        desired: Option<&DesiredResource>,
        version: ResourceVersion,
    ) -> Result<ApplyOutcome, ApplyError> {
        let existing = self.api.get(key).await.map_err(classify)?;

        let converged = match (desired, &existing) {
            (Some(desired), Some(existing)) => diff::diff(
                &key.kind,
                &desired.spec,
                Some(&existing.spec),
                &desired.ownership,
            )
            .is_empty(),
            _ => false,
        };

        if converged {
            debug!(key = %key, version = %version, "Create found resource already in desired shape");
            return Ok(ApplyOutcome::AlreadyConverged);
        }

        warn!(key = %key, version = %version, "Create collided with a diverged resource");
        Err(ApplyError::Conflict(format!(
            "{key} already exists at version {version}"
        )))
    }
}

fn classify(err: ClusterError) -> ApplyError {
    match err {
        ClusterError::Unavailable(_) | ClusterError::Timeout(_) | ClusterError::Expired { .. } => {
            ApplyError::Transient(err.to_string())
        }
        ClusterError::Conflict { .. }
        | ClusterError::AlreadyExists { .. }
        | ClusterError::NotFound => ApplyError::Conflict(err.to_string()),
        ClusterError::Invalid(_) | ClusterError::Forbidden(_) => {
            ApplyError::Rejected(err.to_string())
        }
    }
}
