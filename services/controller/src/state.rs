//! Application state shared across request handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use steward_reconcile::{Reconciler, StatusBoard};

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    reconciler: Reconciler,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                reconciler,
                started_at: Utc::now(),
            }),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    /// Status board of the running reconciler.
    pub fn status(&self) -> &StatusBoard {
        self.inner.reconciler.status()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }
}
