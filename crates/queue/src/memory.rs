//! In-memory job store for tests and development.
//!
//! A single mutex guards all state, so the claim check-and-update is
//! atomic with respect to concurrent callers.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_core::{
    DeadLetterEntry, DeadLetterId, Job, JobId, JobPriority, JobSchedule, JobStatus, JobType,
    NewJob, OrganizationId, ScheduleId, UserId, WorkerId,
};

use super::store::{
    CreateOutcome, FailOutcome, JobFilter, JobPage, JobStats, JobStore, Pagination, RetryDecision,
    StoreError,
};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    schedules: HashMap<ScheduleId, JobSchedule>,
    dead_letters: HashMap<DeadLetterId, DeadLetterEntry>,
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Mutex poisoning only happens if a holder panicked; state is a
        // plain map, so continue with it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn matches_filter(job: &Job, org: OrganizationId, filter: &JobFilter) -> bool {
    job.organization_id == org
        && filter.status.is_none_or(|s| job.status == s)
        && filter
            .job_type
            .as_ref()
            .is_none_or(|t| &job.job_type == t)
        && filter
            .project_id
            .is_none_or(|p| job.project_id == Some(p))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<CreateOutcome, StoreError> {
        let mut inner = self.lock();

        if let Some(key) = &new.idempotency_key {
            let existing = inner
                .jobs
                .values()
                .find(|j| {
                    j.organization_id == new.organization_id
                        && j.job_type == new.job_type
                        && j.idempotency_key.as_deref() == Some(key.as_str())
                        && matches!(j.status, JobStatus::Pending | JobStatus::Running)
                })
                .cloned();
            if let Some(job) = existing {
                return Ok(CreateOutcome {
                    job,
                    deduplicated: true,
                });
            }
        }

        let job = Job::from_submission(new, now);
        inner.jobs.insert(job.id, job.clone());
        Ok(CreateOutcome {
            job,
            deduplicated: false,
        })
    }

    async fn get(&self, org: OrganizationId, id: JobId) -> Result<Option<Job>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .get(&id)
            .filter(|j| j.organization_id == org)
            .cloned())
    }

    async fn list(
        &self,
        org: OrganizationId,
        filter: &JobFilter,
        page: Pagination,
    ) -> Result<JobPage, StoreError> {
        let inner = self.lock();
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| matches_filter(j, org, filter))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| Reverse(j.created_at));

        let total = jobs.len() as u64;
        let jobs: Vec<_> = jobs
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        let has_more = total > (page.offset + page.limit) as u64;

        Ok(JobPage {
            jobs,
            total,
            has_more,
        })
    }

    async fn stats(&self, org: OrganizationId) -> Result<JobStats, StoreError> {
        let inner = self.lock();
        let mut stats = JobStats::default();
        for job in inner.jobs.values().filter(|j| j.organization_id == org) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Dead => stats.dead += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    async fn claim_next(
        &self,
        worker_id: WorkerId,
        allowed_types: Option<&[JobType]>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.lock();

        let candidate = inner
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .filter(|j| allowed_types.is_none_or(|types| types.contains(&j.job_type)))
            .min_by_key(|j| (Reverse(j.priority), j.scheduled_at))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        // Same lock as the scan: the check-and-update is atomic.
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.claim(worker_id, now)?;
        Ok(Some(job.clone()))
    }

    async fn complete(
        &self,
        id: JobId,
        worker_id: WorkerId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if job.status != JobStatus::Running || job.worker_id != Some(worker_id) {
            return Ok(false);
        }
        job.complete(result, now)?;
        Ok(true)
    }

    async fn fail(
        &self,
        id: JobId,
        worker_id: WorkerId,
        error: &str,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if job.status != JobStatus::Running || job.worker_id != Some(worker_id) {
            return Ok(FailOutcome::Lost);
        }

        job.record_failure(error)?;
        match decision {
            RetryDecision::Retry { at } => {
                job.schedule_retry(at)?;
                Ok(FailOutcome::Scheduled { retry_at: at })
            }
            RetryDecision::Dead => {
                job.mark_dead(now)?;
                let entry = DeadLetterEntry::new(
                    job.id,
                    job.organization_id,
                    job.job_type.clone(),
                    error,
                    now,
                );
                inner.dead_letters.insert(entry.id, entry.clone());
                Ok(FailOutcome::Dead(entry))
            }
        }
    }

    async fn cancel(
        &self,
        org: OrganizationId,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .filter(|j| j.organization_id == org)
            .ok_or(StoreError::NotFound)?;
        job.cancel(now)?;
        Ok(job.clone())
    }

    async fn change_priority(
        &self,
        org: OrganizationId,
        id: JobId,
        priority: JobPriority,
    ) -> Result<Job, StoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .filter(|j| j.organization_id == org)
            .ok_or(StoreError::NotFound)?;
        if job.status != JobStatus::Pending {
            return Err(StoreError::InvalidTransition(format!(
                "priority can only change while pending (status {})",
                job.status
            )));
        }
        job.priority = priority;
        Ok(job.clone())
    }

    async fn retry_job(
        &self,
        org: OrganizationId,
        id: JobId,
        requested_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get(&id)
            .filter(|j| j.organization_id == org)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        match job.status {
            JobStatus::Failed => {
                let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
                job.schedule_retry(now)?;
                Ok(job.clone())
            }
            JobStatus::Dead => {
                // The dead record is never mutated back; audit trail stays.
                let mut clone = NewJob::new(
                    job.organization_id,
                    requested_by,
                    job.job_type.clone(),
                    job.name.clone(),
                )
                .with_priority(job.priority)
                .with_payload(job.payload.clone())
                .with_timeout_seconds(job.timeout_seconds)
                .with_max_attempts(job.max_attempts)
                .with_retry_of(job.id);
                if let Some(project) = job.project_id {
                    clone = clone.with_project(project);
                }
                let lineage = Job::from_submission(clone, now);
                inner.jobs.insert(lineage.id, lineage.clone());
                Ok(lineage)
            }
            other => Err(StoreError::InvalidTransition(format!(
                "only failed or dead jobs can be retried (status {other})"
            ))),
        }
    }

    async fn set_progress(
        &self,
        id: JobId,
        worker_id: WorkerId,
        progress: u8,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if job.status != JobStatus::Running || job.worker_id != Some(worker_id) {
            return Ok(false);
        }
        job.progress = Some(progress.min(100));
        Ok(true)
    }

    async fn requeue_due_retries(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let mut count = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Failed && job.scheduled_at <= now {
                let at = job.scheduled_at;
                job.schedule_retry(at)?;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| {
            !(matches!(j.status, JobStatus::Completed | JobStatus::Cancelled)
                && j.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn create_schedule(&self, schedule: JobSchedule) -> Result<JobSchedule, StoreError> {
        let mut inner = self.lock();
        inner.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn list_schedules(&self, org: OrganizationId) -> Result<Vec<JobSchedule>, StoreError> {
        let inner = self.lock();
        let mut schedules: Vec<_> = inner
            .schedules
            .values()
            .filter(|s| s.organization_id == org)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<JobSchedule>, StoreError> {
        let inner = self.lock();
        let mut due: Vec<_> = inner
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn advance_schedule(
        &self,
        id: ScheduleId,
        seen_next_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let schedule = inner.schedules.get_mut(&id).ok_or(StoreError::NotFound)?;
        if schedule.next_run_at != seen_next_run_at {
            return Ok(false);
        }
        schedule.next_run_at = next_run_at;
        schedule.last_run_at = Some(now);
        Ok(true)
    }

    async fn set_schedule_active(
        &self,
        org: OrganizationId,
        id: ScheduleId,
        active: bool,
    ) -> Result<JobSchedule, StoreError> {
        let mut inner = self.lock();
        let schedule = inner
            .schedules
            .get_mut(&id)
            .filter(|s| s.organization_id == org)
            .ok_or(StoreError::NotFound)?;
        schedule.is_active = active;
        Ok(schedule.clone())
    }

    async fn list_dead_letters(
        &self,
        org: OrganizationId,
        resolved: Option<bool>,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let inner = self.lock();
        let mut entries: Vec<_> = inner
            .dead_letters
            .values()
            .filter(|e| e.organization_id == org)
            .filter(|e| resolved.is_none_or(|r| e.resolved == r))
            .cloned()
            .collect();
        entries.sort_by_key(|e| Reverse(e.created_at));
        Ok(entries
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn resolve_dead_letter(
        &self,
        org: OrganizationId,
        id: DeadLetterId,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterEntry, StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .dead_letters
            .get_mut(&id)
            .filter(|e| e.organization_id == org)
            .ok_or(StoreError::NotFound)?;
        if entry.resolved {
            return Err(StoreError::Conflict("entry is already resolved".to_string()));
        }
        entry.resolve(note, now);
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::NewSchedule;
    use jobforge_core::ScheduleSpec;

    fn org() -> OrganizationId {
        OrganizationId::new()
    }

    fn submission(org: OrganizationId, job_type: &str) -> NewJob {
        NewJob::new(
            org,
            UserId::new(),
            JobType::new(job_type).unwrap(),
            format!("{job_type} job"),
        )
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_scheduled_at() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();

        // B is due earlier, but A outranks it.
        let b = store
            .create(
                submission(org, "export.csv")
                    .with_priority(JobPriority::Normal)
                    .with_scheduled_at(now - chrono::Duration::minutes(10)),
                now,
            )
            .await
            .unwrap()
            .job;
        let a = store
            .create(
                submission(org, "export.csv")
                    .with_priority(JobPriority::Critical)
                    .with_scheduled_at(now - chrono::Duration::seconds(10)),
                now,
            )
            .await
            .unwrap()
            .job;

        let first = store.claim_next(WorkerId::new(), None, now).await.unwrap().unwrap();
        let second = store.claim_next(WorkerId::new(), None, now).await.unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
        assert!(store.claim_next(WorkerId::new(), None, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimable() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .create(
                submission(org(), "export.csv")
                    .with_scheduled_at(now + chrono::Duration::minutes(5)),
                now,
            )
            .await
            .unwrap();
        assert!(store.claim_next(WorkerId::new(), None, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_allowed_types() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();
        store.create(submission(org, "export.csv"), now).await.unwrap();

        let allowed = [JobType::new("document.extract").unwrap()];
        assert!(store
            .claim_next(WorkerId::new(), Some(&allowed), now)
            .await
            .unwrap()
            .is_none());

        let allowed = [JobType::new("export.csv").unwrap()];
        assert!(store
            .claim_next(WorkerId::new(), Some(&allowed), now)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_claimers_get_at_most_one_winner_per_job() {
        let store = InMemoryJobStore::arc();
        let org = org();
        let now = Utc::now();

        for _ in 0..10 {
            store.create(submission(org, "export.csv"), now).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..40 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_next(WorkerId::new(), None, now).await.unwrap()
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                claimed.push(job.id);
            }
        }

        // 10 jobs, 40 claimers: exactly 10 wins, all distinct.
        assert_eq!(claimed.len(), 10);
        claimed.sort_by_key(|id| *id.as_uuid());
        claimed.dedup();
        assert_eq!(claimed.len(), 10);
    }

    #[tokio::test]
    async fn idempotency_key_returns_the_existing_job() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();

        let first = store
            .create(submission(org, "export.csv").with_idempotency_key("abc"), now)
            .await
            .unwrap();
        assert!(!first.deduplicated);

        let second = store
            .create(submission(org, "export.csv").with_idempotency_key("abc"), now)
            .await
            .unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.job.id, first.job.id);

        let page = store
            .list(org, &JobFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        // Different type, same key: a distinct logical request.
        let other = store
            .create(
                submission(org, "document.extract").with_idempotency_key("abc"),
                now,
            )
            .await
            .unwrap();
        assert!(!other.deduplicated);
    }

    #[tokio::test]
    async fn idempotency_key_is_released_after_completion() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();

        let first = store
            .create(submission(org, "export.csv").with_idempotency_key("abc"), now)
            .await
            .unwrap()
            .job;
        let claimed = store.claim_next(WorkerId::new(), None, now).await.unwrap().unwrap();
        store
            .complete(claimed.id, claimed.worker_id.unwrap(), serde_json::Value::Null, now)
            .await
            .unwrap();

        let again = store
            .create(submission(org, "export.csv").with_idempotency_key("abc"), now)
            .await
            .unwrap();
        assert!(!again.deduplicated);
        assert_ne!(again.job.id, first.id);
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter_exactly_once() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();

        let job = store
            .create(submission(org, "export.csv").with_max_attempts(2), now)
            .await
            .unwrap()
            .job;

        // First failure: retry scheduled.
        let worker = WorkerId::new();
        store.claim_next(worker, None, now).await.unwrap().unwrap();
        let outcome = store
            .fail(
                job.id,
                worker,
                "boom",
                RetryDecision::Retry { at: now },
                now,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Scheduled { .. }));

        // Second failure: dead.
        let worker = WorkerId::new();
        store.claim_next(worker, None, now).await.unwrap().unwrap();
        let outcome = store
            .fail(job.id, worker, "boom again", RetryDecision::Dead, now)
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Dead(_)));

        let refreshed = store.get(org, job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Dead);
        assert_eq!(refreshed.attempt_count, 2);

        let entries = store
            .list_dead_letters(org, None, Pagination::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, job.id);
        assert_eq!(entries[0].error, "boom again");

        // Dead jobs are not claimable.
        assert!(store.claim_next(WorkerId::new(), None, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn guarded_complete_drops_late_results_for_cancelled_jobs() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();

        let job = store.create(submission(org, "export.csv"), now).await.unwrap().job;
        let worker = WorkerId::new();
        store.claim_next(worker, None, now).await.unwrap().unwrap();

        // Cancelled while the handler is still running.
        store.cancel(org, job.id, now).await.unwrap();

        assert!(!store
            .complete(job.id, worker, serde_json::Value::Null, now)
            .await
            .unwrap());
        let outcome = store
            .fail(job.id, worker, "late", RetryDecision::Dead, now)
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Lost));

        let refreshed = store.get(org, job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn change_priority_is_pending_only() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();

        let job = store.create(submission(org, "export.csv"), now).await.unwrap().job;
        store.change_priority(org, job.id, JobPriority::High).await.unwrap();

        store.claim_next(WorkerId::new(), None, now).await.unwrap().unwrap();
        assert!(store
            .change_priority(org, job.id, JobPriority::Low)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn retry_of_dead_job_creates_a_lineage_job() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();

        let job = store
            .create(
                submission(org, "export.csv")
                    .with_max_attempts(1)
                    .with_payload(serde_json::json!({"month": "2026-07"})),
                now,
            )
            .await
            .unwrap()
            .job;
        let worker = WorkerId::new();
        store.claim_next(worker, None, now).await.unwrap().unwrap();
        store
            .fail(job.id, worker, "boom", RetryDecision::Dead, now)
            .await
            .unwrap();

        let lineage = store.retry_job(org, job.id, UserId::new(), now).await.unwrap();
        assert_ne!(lineage.id, job.id);
        assert_eq!(lineage.retry_of, Some(job.id));
        assert_eq!(lineage.status, JobStatus::Pending);
        assert_eq!(lineage.payload, job.payload);

        // The dead record is untouched, and its DLQ entry stays.
        let original = store.get(org, job.id).await.unwrap().unwrap();
        assert_eq!(original.status, JobStatus::Dead);
        let entries = store
            .list_dead_letters(org, None, Pagination::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn retry_of_failed_job_resurfaces_the_original() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();

        let job = store.create(submission(org, "export.csv"), now).await.unwrap().job;
        let worker = WorkerId::new();
        store.claim_next(worker, None, now).await.unwrap().unwrap();
        store
            .fail(
                job.id,
                worker,
                "boom",
                RetryDecision::Retry {
                    at: now + chrono::Duration::hours(1),
                },
                now,
            )
            .await
            .unwrap();

        let retried = store.retry_job(org, job.id, UserId::new(), now).await.unwrap();
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.status, JobStatus::Pending);
        assert!(retried.scheduled_at <= now);
    }

    #[tokio::test]
    async fn requeue_sweep_is_a_noop_when_retries_already_landed_pending() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();

        for minutes in [-5i64, 5] {
            let job = store.create(submission(org, "export.csv"), now).await.unwrap().job;
            let worker = WorkerId::new();
            store.claim_next(worker, None, now).await.unwrap().unwrap();
            store
                .fail(
                    job.id,
                    worker,
                    "boom",
                    RetryDecision::Retry {
                        at: now + chrono::Duration::minutes(minutes),
                    },
                    now,
                )
                .await
                .unwrap();
        }

        // One retry is due, the other is still backing off. (Failed jobs
        // normally return to pending via `fail`; the sweep is the safety
        // net for ones that did not make it.)
        let stats = store.stats(org).await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(store.requeue_due_retries(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_spares_dead_jobs() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);

        // Completed long ago.
        let done = store.create(submission(org, "export.csv"), old).await.unwrap().job;
        let worker = WorkerId::new();
        store.claim_next(worker, None, old).await.unwrap().unwrap();
        store
            .complete(done.id, worker, serde_json::Value::Null, old)
            .await
            .unwrap();

        // Dead long ago.
        let dead = store
            .create(submission(org, "export.csv").with_max_attempts(1), old)
            .await
            .unwrap()
            .job;
        let worker = WorkerId::new();
        store.claim_next(worker, None, old).await.unwrap().unwrap();
        store
            .fail(dead.id, worker, "boom", RetryDecision::Dead, old)
            .await
            .unwrap();

        let purged = store
            .purge_finished(now - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(org, done.id).await.unwrap().is_none());
        assert!(store.get(org, dead.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn advance_schedule_is_a_compare_and_swap() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let schedule = NewSchedule {
            organization_id: org(),
            created_by: UserId::new(),
            name: "nightly".to_string(),
            job_type: JobType::new("report.generate").unwrap(),
            payload: serde_json::Value::Null,
            priority: JobPriority::Normal,
            spec: ScheduleSpec::IntervalSeconds(3600),
        }
        .into_schedule(now)
        .unwrap();
        let seen = schedule.next_run_at;
        let schedule = store.create_schedule(schedule).await.unwrap();

        let next = now + chrono::Duration::hours(2);
        assert!(store.advance_schedule(schedule.id, seen, next, now).await.unwrap());
        // A racing invocation that saw the old value loses.
        assert!(!store.advance_schedule(schedule.id, seen, next, now).await.unwrap());
    }

    #[tokio::test]
    async fn resolve_dead_letter_keeps_the_job_dead() {
        let store = InMemoryJobStore::new();
        let org = org();
        let now = Utc::now();

        let job = store
            .create(submission(org, "export.csv").with_max_attempts(1), now)
            .await
            .unwrap()
            .job;
        let worker = WorkerId::new();
        store.claim_next(worker, None, now).await.unwrap().unwrap();
        store
            .fail(job.id, worker, "boom", RetryDecision::Dead, now)
            .await
            .unwrap();

        let entry = store
            .list_dead_letters(org, Some(false), Pagination::default())
            .await
            .unwrap()
            .remove(0);
        let resolved = store
            .resolve_dead_letter(org, entry.id, "known upstream outage", now)
            .await
            .unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution_note.as_deref(), Some("known upstream outage"));

        // Second resolve is a conflict; the job stays dead either way.
        assert!(store
            .resolve_dead_letter(org, entry.id, "again", now)
            .await
            .is_err());
        assert_eq!(
            store.get(org, job.id).await.unwrap().unwrap().status,
            JobStatus::Dead
        );
    }

    #[tokio::test]
    async fn cross_org_access_is_invisible() {
        let store = InMemoryJobStore::new();
        let mine = org();
        let theirs = org();
        let now = Utc::now();

        let job = store.create(submission(mine, "export.csv"), now).await.unwrap().job;
        assert!(store.get(theirs, job.id).await.unwrap().is_none());
        assert!(store.cancel(theirs, job.id, now).await.is_err());
        let page = store
            .list(theirs, &JobFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }
}
