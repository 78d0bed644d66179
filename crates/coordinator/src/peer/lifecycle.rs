//! Peer link failure handling
//!
//! ICE restarts are bounded by a policy with exponential backoff, and a
//! per-link tracker guarantees at most one restart per failure transition
//! even when the state-change callback re-fires with the same state.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// ICE restart policy for failed peer connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum ICE restart attempts before giving up (default: 5)
    pub max_restarts: u32,

    /// Initial backoff delay in milliseconds (default: 1000)
    pub backoff_initial_ms: u64,

    /// Maximum backoff delay in milliseconds (default: 30000)
    pub backoff_max_ms: u64,

    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff duration before the given attempt (0-indexed)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(ms.min(self.backoff_max_ms as f64) as u64)
    }

    /// Whether another restart is allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_restarts
    }
}

/// Tracks failure transitions for one peer link
#[derive(Debug, Default)]
pub struct RestartTracker {
    in_failure: AtomicBool,
    attempts: AtomicU32,
}

impl RestartTracker {
    /// Create a fresh tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark entry into the failed state.
    ///
    /// Returns true exactly once per failure transition; repeated callbacks
    /// while still failed return false.
    pub fn begin_failure(&self) -> bool {
        self.in_failure
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Record a restart attempt, returning the attempt index
    pub fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst)
    }

    /// Restart attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connection recovered; the next failure is a new transition
    pub fn clear_failure(&self) {
        self.in_failure.store(false, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// The connection left the failed state without recovering (a restart
    /// offer is being negotiated). A renewed failure is a new transition,
    /// but the attempt count carries over so the budget still binds.
    pub fn rearm(&self) {
        self.in_failure.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(10), Duration::from_millis(30000));
    }

    #[test]
    fn test_retry_limit() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn test_one_restart_per_failure_transition() {
        let tracker = RestartTracker::new();

        // Callback fires three times for the same failure
        assert!(tracker.begin_failure());
        assert!(!tracker.begin_failure());
        assert!(!tracker.begin_failure());

        // Recovery, then a new failure transition
        tracker.clear_failure();
        assert!(tracker.begin_failure());
    }

    #[test]
    fn test_rearm_allows_refailure_but_keeps_budget() {
        let tracker = RestartTracker::new();

        // First failure spends attempt 0, then the restart offer moves the
        // connection back to connecting
        assert!(tracker.begin_failure());
        assert_eq!(tracker.record_attempt(), 0);
        tracker.rearm();

        // The restart fails too; this must count as a fresh transition with
        // the budget carried over
        assert!(tracker.begin_failure());
        assert_eq!(tracker.record_attempt(), 1);
        assert_eq!(tracker.attempts(), 2);
    }

    #[test]
    fn test_attempts_reset_on_recovery() {
        let tracker = RestartTracker::new();
        tracker.begin_failure();
        assert_eq!(tracker.record_attempt(), 0);
        assert_eq!(tracker.record_attempt(), 1);
        tracker.clear_failure();
        assert_eq!(tracker.attempts(), 0);
    }
}
