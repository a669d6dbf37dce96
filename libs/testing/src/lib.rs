//! Test fixtures for steward.
//!
//! - [`FlakyCluster`]: wraps any [`ClusterApi`](steward_reconcile::ClusterApi) and
//!   injects scripted failures and delays
//! - [`OverlapTracker`]: detects overlapping applies to the same key
//! - [`ToggleStore`]: wraps a desired-state store and simulates outages
//! - [`eventually`]: polls a condition until it holds or a deadline passes

mod flaky;
mod overlap;
mod store;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

pub use flaky::{FlakyCluster, Fault};
pub use overlap::{OverlapGuard, OverlapTracker};
pub use store::ToggleStore;

static INIT_TRACING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; silent by default.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Poll `check` every 10ms until it returns true or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
