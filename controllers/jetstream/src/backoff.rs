//! # Exponential Backoff
//!
//! Retry delays for failed reconciliations. Each key doubles its delay on
//! every consecutive failure, starting at `min` and capped at `max`. A success
//! forgets the key, so its next failure starts at `min` again.
//!
//! Sequence with the defaults: 2s, 4s, 8s, 16s, 32s, 64s, 128s, 256s, 300s (max).

use crate::reconciler::ReconcileKey;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Default first retry delay
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(2);
/// Default delay cap
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay returned by the next call
    current: Duration,
    /// Maximum delay
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff doubling from `min` up to `max`
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { current: min, max }
    }

    /// Get the next delay and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        result
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

/// Per-key backoff bookkeeping shared by all workers
#[derive(Debug)]
pub struct BackoffTracker {
    min: Duration,
    max: Duration,
    states: Mutex<HashMap<ReconcileKey, ExponentialBackoff>>,
}

impl BackoffTracker {
    /// Create a tracker whose keys start at `min` and cap at `max`
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next(&self, key: &ReconcileKey) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states
            .entry(key.clone())
            .or_insert_with(|| ExponentialBackoff::new(self.min, self.max))
            .next_backoff()
    }

    /// Forget failures for `key` after a success
    pub fn reset(&self, key: &ReconcileKey) {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states.remove(key);
    }
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}
