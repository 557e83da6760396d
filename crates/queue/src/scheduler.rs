//! Periodic maintenance: schedule materialization, the retry safety net,
//! and retention cleanup.
//!
//! Nothing here runs on its own; each sweep is invoked from the batch
//! trigger. Concurrent invocations are safe: materialization advances
//! `next_run_at` with a compare-and-swap before creating the job, so one
//! firing produces exactly one job.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::store::{JobStore, StoreError};

/// Default retention for finished (completed/cancelled) jobs.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    retention: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub fn with_default_retention(store: Arc<dyn JobStore>) -> Self {
        Self::new(store, Duration::days(DEFAULT_RETENTION_DAYS))
    }

    /// Materialize one job per due active schedule, recomputing the next
    /// firing relative to `now` (a scheduler outage never causes a burst of
    /// backlogged catch-up jobs). Returns the number of jobs created.
    pub async fn process_schedules(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut materialized = 0;

        for schedule in self.store.due_schedules(now).await? {
            let next_run_at = match schedule.spec.next_occurrence(now) {
                Ok(at) => at,
                Err(e) => {
                    // One broken definition must not starve the rest.
                    warn!(schedule_id = %schedule.id, error = %e, "skipping unusable schedule");
                    continue;
                }
            };

            let advanced = self
                .store
                .advance_schedule(schedule.id, schedule.next_run_at, next_run_at, now)
                .await?;
            if !advanced {
                // A concurrent invocation took this firing.
                continue;
            }

            let job = self.store.create(schedule.materialize(now), now).await?.job;
            info!(
                schedule_id = %schedule.id,
                job_id = %job.id,
                job_type = %job.job_type,
                %next_run_at,
                "materialized scheduled job"
            );
            materialized += 1;
        }

        Ok(materialized)
    }

    /// Safety-net sweep: re-surface retry-scheduled jobs whose time has
    /// arrived, independent of the claim query's own scheduled_at filter.
    pub async fn retry_pending_jobs(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let requeued = self.store.requeue_due_retries(now).await?;
        if requeued > 0 {
            info!(requeued, "re-surfaced retry-scheduled jobs");
        }
        Ok(requeued)
    }

    /// Purge completed/cancelled jobs past the retention window. Dead jobs
    /// are retained until explicitly resolved.
    pub async fn cleanup_jobs(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let purged = self.store.purge_finished(now - self.retention).await?;
        if purged > 0 {
            info!(purged, "purged finished jobs past retention");
        }
        Ok(purged)
    }
}
