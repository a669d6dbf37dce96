use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use steward_reconcile::{DesiredBatch, DesiredSnapshot, DesiredStateStore, ResumeToken, StoreError};

/// A [`DesiredStateStore`] that can be switched off.
///
/// While unavailable every call fails with [`StoreError::Unavailable`].
pub struct ToggleStore {
    inner: Arc<dyn DesiredStateStore>,
    available: AtomicBool,
    expire_next: AtomicBool,
    failed_calls: AtomicUsize,
}

impl ToggleStore {
    pub fn new(inner: Arc<dyn DesiredStateStore>) -> Self {
        Self {
            inner,
            available: AtomicBool::new(true),
            expire_next: AtomicBool::new(false),
            failed_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Make the next `changes` call report its token as expired.
    pub fn expire_next_changes(&self) {
        self.expire_next.store(true, Ordering::SeqCst);
    }

    /// Calls rejected while unavailable.
    pub fn failed_calls(&self) -> usize {
        self.failed_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.is_available() {
            return Ok(());
        }
        self.failed_calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }
}

#[async_trait]
impl DesiredStateStore for ToggleStore {
    async fn list(&self) -> Result<DesiredSnapshot, StoreError> {
        self.check()?;
        self.inner.list().await
    }

    async fn changes(&self, after: ResumeToken, limit: usize) -> Result<DesiredBatch, StoreError> {
        self.check()?;
        if self.expire_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Expired(after));
        }
        self.inner.changes(after, limit).await
    }
}
