//! Exponential backoff policy for transfer attempts.
//!
//! Deliberately jitter-free: the storage operator already jitters its own
//! low-level retries, and deterministic delays keep the engine testable.

use crate::config::SyncConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.retry_count,
            Duration::from_millis(config.retry_delay_ms),
        )
    }

    /// Delay to sleep after a failed attempt (1-based): base * 2^(attempt-1),
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.base_delay.saturating_mul(1u32 << exp);
        scaled.min(self.max_delay)
    }
}
