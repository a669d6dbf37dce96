//! Backoff and retry budget policies.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay before jitter.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// A policy with no delay at all.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given retry number (0 for the first retry).
    ///
    /// `base × 2^retry`, capped at `max`, then spread by ±`jitter`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.min(32) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let final_delay = if jitter > 0.0 && delay > 0.0 {
            let spread = rand::rng().random_range(-jitter..=jitter);
            delay * (1.0 + spread)
        } else {
            delay
        };

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry { delay: Duration },

    /// No attempts left.
    Exhausted,
}

/// Retry budget for transient failures and the separate conflict allowance.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Apply attempts allowed before the resource is marked as errored.
    pub max_attempts: u32,

    /// Consecutive version conflicts re-diffed without touching the budget.
    pub max_conflicts: u32,

    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_conflicts: DEFAULT_MAX_CONFLICTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Decide after `attempts` consecutive failed attempts (1 after the first failure).
    pub fn after_failure(&self, attempts: u32) -> RetryDecision {
        if attempts >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            delay: self.backoff.delay(attempts.saturating_sub(1)),
        }
    }

    /// Returns true while another conflict can be absorbed without backoff.
    pub fn absorbs_conflict(&self, conflicts: u32) -> bool {
        conflicts <= self.max_conflicts
    }
}

/// Default apply attempts per generation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default consecutive conflicts before a conflict counts against the budget.
pub const DEFAULT_MAX_CONFLICTS: u32 = 10;
