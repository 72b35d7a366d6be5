//! Fixed-delay retry policy for failed sync cycles.
//!
//! Retries happen at cycle granularity: a failed cycle moves the engine to
//! `AwaitingRetry` and the scheduler starts a new cycle after `retry_delay`.
//! The delay does not grow between attempts.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of consecutive failed cycles after which automatic retry stops.
    pub max_retries: u32,
    /// Delay before the next attempt.
    pub retry_delay: Duration,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::from_secs(30),
        }
    }

    /// Set the delay between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Decide what follows the `attempt`-th consecutive failure (1-based).
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.retry_delay)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// What to do after a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another cycle after the delay.
    RetryAfter(Duration),
    /// Stop retrying automatically.
    GiveUp,
}

/// Counts consecutive failed cycles.
#[derive(Debug)]
pub struct RetryTracker {
    config: RetryConfig,
    attempts: AtomicU32,
}

impl RetryTracker {
    /// Create a tracker with no recorded failures.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: AtomicU32::new(0),
        }
    }

    /// Record a failure and return `(attempt, decision)`.
    ///
    /// Giving up resets the counter, so the next trigger starts a fresh
    /// series of attempts.
    pub fn record_failure(&self) -> (u32, RetryDecision) {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let decision = self.config.decide(attempt);
        if decision == RetryDecision::GiveUp {
            self.attempts.store(0, Ordering::Release);
        }
        debug!("Recorded failed attempt {}: {:?}", attempt, decision);
        (attempt, decision)
    }

    /// Forget previous failures.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Release);
    }

    /// Consecutive failures recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_fixed() {
        let config = RetryConfig::new(5).with_retry_delay(Duration::from_secs(7));
        assert_eq!(config.decide(1), RetryDecision::RetryAfter(Duration::from_secs(7)));
        assert_eq!(config.decide(4), RetryDecision::RetryAfter(Duration::from_secs(7)));
    }

    #[test]
    fn test_gives_up_at_max() {
        let config = RetryConfig::new(3);
        assert!(matches!(config.decide(2), RetryDecision::RetryAfter(_)));
        assert_eq!(config.decide(3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_tracker_sequence() {
        let tracker = RetryTracker::new(RetryConfig::new(3));

        assert!(matches!(tracker.record_failure(), (1, RetryDecision::RetryAfter(_))));
        assert!(matches!(tracker.record_failure(), (2, RetryDecision::RetryAfter(_))));
        assert_eq!(tracker.record_failure(), (3, RetryDecision::GiveUp));

        // Exhaustion leaves the tracker usable for the next trigger
        assert_eq!(tracker.attempts(), 0);
        assert!(matches!(tracker.record_failure(), (1, RetryDecision::RetryAfter(_))));
    }

    #[test]
    fn test_reset() {
        let tracker = RetryTracker::default();
        tracker.record_failure();
        tracker.record_failure();
        tracker.reset();
        assert_eq!(tracker.attempts(), 0);
    }

    #[test]
    fn test_zero_max_retries_never_retries() {
        let tracker = RetryTracker::new(RetryConfig::new(0));
        assert_eq!(tracker.record_failure(), (1, RetryDecision::GiveUp));
    }
}
