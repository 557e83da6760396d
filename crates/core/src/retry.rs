//! Retry policy: exponential backoff with jitter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff configuration for failed attempts.
///
/// Delay for attempt `n` (1-indexed) is `base_delay * 2^(n-1)`, clamped to
/// `max_delay`, with up to `jitter * delay` of randomness in either direction
/// to avoid synchronized retry storms. The constants are a deliberate choice:
/// 30s base doubling to a 1h cap covers transient outages without hammering
/// a struggling dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor in 0.0..=1.0. Zero disables jitter (deterministic tests).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy without jitter, for deterministic scheduling in tests.
    pub fn deterministic(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Delay before retrying after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(attempt.saturating_sub(1).min(31) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);

        let jittered = if self.jitter > 0.0 {
            let spread = delay_ms * self.jitter;
            delay_ms + (fastrand::f64() * 2.0 - 1.0) * spread
        } else {
            delay_ms
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Absolute retry instant for the given failed attempt.
    pub fn retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64))
    }
}
