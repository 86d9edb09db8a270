//! Exponential backoff for outbound message redelivery.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration for the retry coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Send attempts before a message is dead-lettered.
    pub max_attempts: u32,
    /// Base delay; the n-th retry waits `base * 2^n`.
    pub base_delay_ms: u64,
    /// Cap on the backoff delay.
    pub max_delay_ms: u64,
    /// How long a SENT message may wait for confirmation before it is retried.
    pub confirmation_timeout_ms: u64,
    /// Coordinator tick.
    pub poll_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            confirmation_timeout_ms: 600_000,
            poll_interval_ms: 1_000,
        }
    }
}

/// Stateless backoff policy — computes retry times from the attempt count.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// `base * 2^attempt_count`, capped at the maximum.
    pub fn delay(&self, attempt_count: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Absolute time of the next retry.
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt_count: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt_count))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.max.as_millis() as i64));
        now + delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2))
    }

    #[test]
    fn doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.delay(0).as_millis(), 100);
        assert_eq!(p.delay(1).as_millis(), 200);
        assert_eq!(p.delay(3).as_millis(), 800);
    }

    #[test]
    fn capped_at_max() {
        let p = policy();
        assert_eq!(p.delay(5), Duration::from_secs(2));
        assert_eq!(p.delay(200), Duration::from_secs(2));
    }

    #[test]
    fn next_retry_is_relative_to_now() {
        let now = Utc::now();
        let at = policy().next_retry_at(now, 2);
        assert_eq!((at - now).num_milliseconds(), 400);
    }
}
