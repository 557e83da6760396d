//! Decides what happens after a failed attempt.

use chrono::{DateTime, Utc};

use jobforge_core::{Job, RetryPolicy};

use super::store::RetryDecision;

/// Backoff computation and dead-letter promotion.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Verdict for the attempt that just failed (the job still carries its
    /// pre-failure `attempt_count`; the store increments it atomically with
    /// the transition).
    pub fn decide(&self, job: &Job, now: DateTime<Utc>) -> RetryDecision {
        let failed_attempt = job.attempt_count + 1;
        if failed_attempt < job.max_attempts {
            RetryDecision::Retry {
                at: self.policy.retry_at(now, failed_attempt),
            }
        } else {
            RetryDecision::Dead
        }
    }
}
