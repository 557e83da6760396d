//! The job record and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, OrganizationId, ProjectId, UserId, WorkerId};

/// Default handler deadline when a submission does not specify one.
pub const DEFAULT_TIMEOUT_SECONDS: u32 = 600;
/// Default retry budget when a submission does not specify one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const TIMEOUT_SECONDS_MIN: u32 = 1;
pub const TIMEOUT_SECONDS_MAX: u32 = 3600;
pub const MAX_ATTEMPTS_MIN: u32 = 1;
pub const MAX_ATTEMPTS_MAX: u32 = 10;

/// Claim-preference ordinal. Strictly orders claim order among eligible
/// pending jobs; within equal priority, earlier `scheduled_at` wins.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }

    /// Storage ordinal (ORDER BY priority DESC in the claim query).
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Critical => 3,
        }
    }

    pub fn from_i16(value: i16) -> DomainResult<Self> {
        match value {
            0 => Ok(JobPriority::Low),
            1 => Ok(JobPriority::Normal),
            2 => Ok(JobPriority::High),
            3 => Ok(JobPriority::Critical),
            other => Err(DomainError::validation(format!(
                "unknown priority ordinal: {other}"
            ))),
        }
    }
}

impl core::str::FromStr for JobPriority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            "critical" => Ok(JobPriority::Critical),
            other => Err(DomainError::validation(format!(
                "priority must be one of: low, normal, high, critical (got {other:?})"
            ))),
        }
    }
}

impl core::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed once `scheduled_at` arrives.
    Pending,
    /// Owned by exactly one worker.
    Running,
    /// Finished successfully (terminal).
    Completed,
    /// Last attempt failed; waiting for a retry slot or a dead-letter verdict.
    Failed,
    /// Retry budget exhausted (terminal); has exactly one dead-letter entry.
    Dead,
    /// Cancelled cooperatively (terminal).
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Dead | JobStatus::Cancelled
        )
    }

    /// The transition table. Every status mutation in the store goes through
    /// a named operation that consults this.
    pub fn may_become(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
                | (Failed, Dead)
        )
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown job status: {other:?}"
            ))),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler-routing discriminator.
///
/// Payloads are opaque to the queue; the handler registered under this type
/// interprets them (and validates its own schema at the dispatch boundary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(String);

impl JobType {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        if value.len() > 64 {
            return Err(DomainError::validation("job_type must be at most 64 chars"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
        {
            return Err(DomainError::validation(
                "job_type may only contain lowercase alphanumerics, '_', '.', '-'",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for JobType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A unit of asynchronous work tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub organization_id: OrganizationId,
    pub created_by: UserId,
    pub project_id: Option<ProjectId>,
    pub job_type: JobType,
    pub name: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Opaque payload, interpreted only by the matching handler.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Earliest claimable instant (also carries the retry backoff).
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of attempts that have finished (successfully or not).
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub timeout_seconds: u32,
    /// Owner while running. Exactly one worker holds this at a time.
    pub worker_id: Option<WorkerId>,
    /// Handler-reported progress, 0..=100.
    pub progress: Option<u8>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub idempotency_key: Option<String>,
    /// Set on jobs created by manually retrying a dead job.
    pub retry_of: Option<JobId>,
}

impl Job {
    /// Materialize a validated submission into a pending record.
    pub fn from_submission(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            organization_id: new.organization_id,
            created_by: new.created_by,
            project_id: new.project_id,
            job_type: new.job_type,
            name: new.name,
            status: JobStatus::Pending,
            priority: new.priority,
            payload: new.payload,
            created_at: now,
            scheduled_at: new.scheduled_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            attempt_count: 0,
            max_attempts: new.max_attempts,
            timeout_seconds: new.timeout_seconds,
            worker_id: None,
            progress: None,
            result: None,
            error: None,
            idempotency_key: new.idempotency_key,
            retry_of: new.retry_of,
        }
    }

    /// Whether a claimer may take this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.may_become(next) {
            return Err(DomainError::invalid_transition(format!(
                "{} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// pending -> running, assigning the owner.
    pub fn claim(&mut self, worker_id: WorkerId, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_claimable(now) {
            return Err(DomainError::invalid_transition(format!(
                "job {} is not claimable (status {}, scheduled_at {})",
                self.id, self.status, self.scheduled_at
            )));
        }
        self.transition(JobStatus::Running)?;
        self.worker_id = Some(worker_id);
        self.started_at = Some(now);
        self.error = None;
        Ok(())
    }

    /// running -> completed, storing the handler result.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.worker_id = None;
        Ok(())
    }

    /// running -> failed, capturing the error and counting the attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.attempt_count += 1;
        self.error = Some(error.into());
        self.worker_id = None;
        self.progress = None;
        Ok(())
    }

    /// failed -> pending, with the backoff encoded in `scheduled_at`.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Pending)?;
        self.scheduled_at = at;
        self.started_at = None;
        Ok(())
    }

    /// failed -> dead (terminal).
    pub fn mark_dead(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Dead)?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// pending/running -> cancelled. Cooperative: an in-flight handler is not
    /// interrupted; its late result is dropped by the guarded store ops.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Cancelled)?;
        self.completed_at = Some(now);
        self.worker_id = None;
        Ok(())
    }
}

/// A validated job submission.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub organization_id: OrganizationId,
    pub created_by: UserId,
    pub project_id: Option<ProjectId>,
    pub job_type: JobType,
    pub name: String,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u32,
    pub max_attempts: u32,
    pub idempotency_key: Option<String>,
    pub retry_of: Option<JobId>,
}

impl NewJob {
    pub fn new(
        organization_id: OrganizationId,
        created_by: UserId,
        job_type: JobType,
        name: impl Into<String>,
    ) -> Self {
        Self {
            organization_id,
            created_by,
            project_id: None,
            job_type,
            name: name.into(),
            priority: JobPriority::default(),
            payload: serde_json::Value::Null,
            scheduled_at: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            idempotency_key: None,
            retry_of: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_retry_of(mut self, original: JobId) -> Self {
        self.retry_of = Some(original);
        self
    }

    /// Reject malformed submissions before anything is enqueued.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name must not be empty"));
        }
        if self.name.len() > 200 {
            return Err(DomainError::validation("name must be at most 200 chars"));
        }
        if !(TIMEOUT_SECONDS_MIN..=TIMEOUT_SECONDS_MAX).contains(&self.timeout_seconds) {
            return Err(DomainError::validation(format!(
                "timeout_seconds must be within [{TIMEOUT_SECONDS_MIN}, {TIMEOUT_SECONDS_MAX}]"
            )));
        }
        if !(MAX_ATTEMPTS_MIN..=MAX_ATTEMPTS_MAX).contains(&self.max_attempts) {
            return Err(DomainError::validation(format!(
                "max_attempts must be within [{MAX_ATTEMPTS_MIN}, {MAX_ATTEMPTS_MAX}]"
            )));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() || key.len() > 128 {
                return Err(DomainError::validation(
                    "idempotency_key must be 1..=128 chars",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> NewJob {
        NewJob::new(
            OrganizationId::new(),
            UserId::new(),
            JobType::new("report.generate").unwrap(),
            "monthly report",
        )
    }

    #[test]
    fn priority_ordinal_round_trips() {
        for p in [
            JobPriority::Low,
            JobPriority::Normal,
            JobPriority::High,
            JobPriority::Critical,
        ] {
            assert_eq!(JobPriority::from_i16(p.as_i16()).unwrap(), p);
        }
        assert!(JobPriority::from_i16(9).is_err());
    }

    #[test]
    fn priority_orders_claim_preference() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn job_type_rejects_bad_values() {
        assert!(JobType::new("").is_err());
        assert!(JobType::new("Has Spaces").is_err());
        assert!(JobType::new("UPPER").is_err());
        assert!(JobType::new("a".repeat(65)).is_err());
        assert!(JobType::new("eligibility.scan").is_ok());
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use JobStatus::*;
        assert!(Pending.may_become(Running));
        assert!(Pending.may_become(Cancelled));
        assert!(Running.may_become(Completed));
        assert!(Running.may_become(Failed));
        assert!(Running.may_become(Cancelled));
        assert!(Failed.may_become(Pending));
        assert!(Failed.may_become(Dead));

        assert!(!Pending.may_become(Completed));
        assert!(!Completed.may_become(Running));
        assert!(!Dead.may_become(Pending));
        assert!(!Cancelled.may_become(Running));
    }

    #[test]
    fn claim_respects_scheduled_at() {
        let now = Utc::now();
        let mut job = Job::from_submission(
            submission().with_scheduled_at(now + chrono::Duration::minutes(5)),
            now,
        );
        assert!(job.claim(WorkerId::new(), now).is_err());
        assert!(job.claim(WorkerId::new(), now + chrono::Duration::minutes(6)).is_ok());
    }

    #[test]
    fn lifecycle_success() {
        let now = Utc::now();
        let mut job = Job::from_submission(submission(), now);
        assert_eq!(job.status, JobStatus::Pending);

        job.claim(WorkerId::new(), now).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.worker_id.is_some());

        job.complete(serde_json::json!({"rows": 10}), now).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn lifecycle_failure_counts_attempts() {
        let now = Utc::now();
        let mut job = Job::from_submission(submission(), now);
        job.claim(WorkerId::new(), now).unwrap();
        job.record_failure("boom").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.error.as_deref(), Some("boom"));

        job.schedule_retry(now + chrono::Duration::seconds(30)).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_claimable(now));
    }

    #[test]
    fn cancelled_job_rejects_completion() {
        let now = Utc::now();
        let mut job = Job::from_submission(submission(), now);
        job.claim(WorkerId::new(), now).unwrap();
        job.cancel(now).unwrap();
        assert!(job.complete(serde_json::Value::Null, now).is_err());
    }

    #[test]
    fn submission_bounds() {
        assert!(submission().validate().is_ok());
        assert!(submission().with_timeout_seconds(0).validate().is_err());
        assert!(submission().with_timeout_seconds(3601).validate().is_err());
        assert!(submission().with_max_attempts(0).validate().is_err());
        assert!(submission().with_max_attempts(11).validate().is_err());
        assert!(submission().with_idempotency_key("").validate().is_err());

        let mut blank = submission();
        blank.name = "  ".to_string();
        assert!(blank.validate().is_err());
    }
}
