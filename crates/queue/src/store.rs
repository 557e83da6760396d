//! The job store abstraction: sole owner of status transitions.
//!
//! No other component writes job status directly; every mutation goes
//! through one of the named operations here. Implementations must make
//! `claim_next` safe under concurrent callers: at most one winner per row,
//! via compare-and-swap (in memory) or a conditional update over a locked
//! row (Postgres). Never read-then-write without a guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_core::{
    DeadLetterEntry, DeadLetterId, DomainError, Job, JobId, JobPriority, JobSchedule, JobStatus,
    JobType, NewJob, OrganizationId, ProjectId, ScheduleId, UserId, WorkerId,
};

/// Store-level error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => StoreError::NotFound,
            DomainError::InvalidTransition(msg) => StoreError::InvalidTransition(msg),
            DomainError::Conflict(msg) => StoreError::Conflict(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                StoreError::Conflict(msg)
            }
        }
    }
}

/// Offset pagination for listings.
#[derive(Debug, Copy, Clone)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: usize = 200;

    pub fn clamped(limit: Option<usize>, offset: Option<usize>) -> Self {
        Self {
            limit: limit.unwrap_or(50).clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Listing filter (all conjunctive).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub project_id: Option<ProjectId>,
}

/// One page of jobs plus the unpaginated total.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub has_more: bool,
}

/// Per-status counts for an organization.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub cancelled: u64,
}

/// Result of a create: either a fresh job or the pre-existing one matched
/// by idempotency key.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub job: Job,
    pub deduplicated: bool,
}

/// What the retry manager decided for a failed attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue with backoff: the job returns to pending at `at`.
    Retry { at: DateTime<Utc> },
    /// Retry budget exhausted: dead-letter the job.
    Dead,
}

/// Result of `fail`.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Requeued; claimable again once `retry_at` arrives.
    Scheduled { retry_at: DateTime<Utc> },
    /// Terminal; exactly one dead-letter entry was created.
    Dead(DeadLetterEntry),
    /// The ownership guard missed (e.g. cancelled mid-flight); nothing
    /// was written.
    Lost,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Record a pending job. With an idempotency key, returns the existing
    /// pending/running job for the same organization + type + key instead
    /// of creating a duplicate (at-most-once submission).
    async fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<CreateOutcome, StoreError>;

    async fn get(&self, org: OrganizationId, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn list(
        &self,
        org: OrganizationId,
        filter: &JobFilter,
        page: Pagination,
    ) -> Result<JobPage, StoreError>;

    async fn stats(&self, org: OrganizationId) -> Result<JobStats, StoreError>;

    /// Atomically transition exactly one eligible pending job to running.
    ///
    /// Eligibility: status=pending AND scheduled_at <= now (AND job_type in
    /// `allowed_types` when given). Selection: priority descending, then
    /// scheduled_at ascending. Returns `None` when nothing is eligible; a
    /// lost race shows up as `None` too, never as an error.
    async fn claim_next(
        &self,
        worker_id: WorkerId,
        allowed_types: Option<&[JobType]>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// running -> completed, guarded on (status, worker_id). Returns false
    /// when the guard misses, i.e. the job was cancelled mid-flight.
    async fn complete(
        &self,
        id: JobId,
        worker_id: WorkerId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// running -> failed, then per `decision` either failed -> pending with
    /// the retry instant, or failed -> dead plus exactly one dead-letter
    /// entry. Guarded on (status, worker_id) like `complete`.
    async fn fail(
        &self,
        id: JobId,
        worker_id: WorkerId,
        error: &str,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError>;

    /// pending/running -> cancelled (cooperative).
    async fn cancel(
        &self,
        org: OrganizationId,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Pending jobs only.
    async fn change_priority(
        &self,
        org: OrganizationId,
        id: JobId,
        priority: JobPriority,
    ) -> Result<Job, StoreError>;

    /// Operator retry. A failed job is re-surfaced (failed -> pending, due
    /// immediately). A dead job is never mutated: its payload is cloned
    /// into a new pending job carrying `retry_of` lineage.
    async fn retry_job(
        &self,
        org: OrganizationId,
        id: JobId,
        requested_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Handler-reported progress (0..=100); guarded like `complete`.
    async fn set_progress(
        &self,
        id: JobId,
        worker_id: WorkerId,
        progress: u8,
    ) -> Result<bool, StoreError>;

    /// Safety-net sweep: failed jobs whose retry instant has arrived go
    /// back to pending. Returns the number of jobs re-surfaced.
    async fn requeue_due_retries(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Purge completed/cancelled jobs finished before `cutoff`. Dead jobs
    /// are retained until explicitly resolved elsewhere.
    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // ── schedules ──────────────────────────────────────────────────────

    async fn create_schedule(&self, schedule: JobSchedule) -> Result<JobSchedule, StoreError>;

    async fn list_schedules(&self, org: OrganizationId) -> Result<Vec<JobSchedule>, StoreError>;

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<JobSchedule>, StoreError>;

    /// Compare-and-swap advance of `next_run_at`. Returns false when a
    /// concurrent scheduler invocation already advanced the firing; the
    /// loser must not materialize a job for this slot.
    async fn advance_schedule(
        &self,
        id: ScheduleId,
        seen_next_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn set_schedule_active(
        &self,
        org: OrganizationId,
        id: ScheduleId,
        active: bool,
    ) -> Result<JobSchedule, StoreError>;

    // ── dead letters ───────────────────────────────────────────────────

    async fn list_dead_letters(
        &self,
        org: OrganizationId,
        resolved: Option<bool>,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Mark an entry resolved with a triage note. The underlying job keeps
    /// its terminal dead status.
    async fn resolve_dead_letter(
        &self,
        org: OrganizationId,
        id: DeadLetterId,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterEntry, StoreError>;
}
