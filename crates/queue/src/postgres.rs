//! Postgres-backed job store.
//!
//! The claim primitive is a single conditional UPDATE over a
//! `FOR UPDATE SKIP LOCKED` subselect: concurrent claimers each lock a
//! different candidate row, and the `status = 'pending'` guard on the outer
//! UPDATE makes the pending->running transition a compare-and-swap. A lost
//! race surfaces as zero rows, never as an error.
//!
//! SQLx errors are mapped to [`StoreError`]: unique violations (code 23505)
//! become `Conflict`, everything else `Storage`.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use jobforge_core::{
    DeadLetterEntry, DeadLetterId, DomainError, Job, JobId, JobPriority, JobSchedule, JobStatus,
    JobType, NewJob, OrganizationId, ProjectId, ScheduleId, ScheduleSpec, UserId, WorkerId,
};

use super::store::{
    CreateOutcome, FailOutcome, JobFilter, JobPage, JobStats, JobStore, Pagination, RetryDecision,
    StoreError,
};

const JOB_COLUMNS: &str = "id, organization_id, created_by, project_id, job_type, name, status, \
     priority, payload, created_at, scheduled_at, started_at, completed_at, attempt_count, \
     max_attempts, timeout_seconds, worker_id, progress, result, error, idempotency_key, retry_of";

const SCHEDULE_COLUMNS: &str = "id, organization_id, created_by, name, job_type, payload, \
     priority, spec, next_run_at, is_active, created_at, last_run_at";

const DEAD_LETTER_COLUMNS: &str =
    "id, job_id, organization_id, job_type, error, created_at, resolved, resolved_at, \
     resolution_note";

/// Durable job store over a SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the embedded migrations (idempotent).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))
    }

    async fn find_idempotent(
        &self,
        org: OrganizationId,
        job_type: &JobType,
        key: &str,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE organization_id = $1 AND job_type = $2 AND idempotency_key = $3 \
               AND status IN ('pending', 'running') \
             LIMIT 1"
        ))
        .bind(org.as_uuid())
        .bind(job_type.as_str())
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(job_from_row).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new), fields(job_type = %new.job_type), err)]
    async fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<CreateOutcome, StoreError> {
        if let Some(key) = new.idempotency_key.clone() {
            if let Some(job) = self
                .find_idempotent(new.organization_id, &new.job_type, &key)
                .await?
            {
                return Ok(CreateOutcome {
                    job,
                    deduplicated: true,
                });
            }

            let job = Job::from_submission(new, now);
            return match insert_job(&*self.pool, &job).await {
                Ok(()) => Ok(CreateOutcome {
                    job,
                    deduplicated: false,
                }),
                // Concurrent submitter won the partial unique index.
                Err(e) if is_unique_violation(&e) => {
                    let existing = self
                        .find_idempotent(job.organization_id, &job.job_type, &key)
                        .await?
                        .ok_or_else(|| {
                            StoreError::Conflict(
                                "idempotent insert raced but the winner is gone".to_string(),
                            )
                        })?;
                    Ok(CreateOutcome {
                        job: existing,
                        deduplicated: true,
                    })
                }
                Err(e) => Err(map_sqlx_error(e)),
            };
        }

        let job = Job::from_submission(new, now);
        insert_job(&*self.pool, &job).await.map_err(map_sqlx_error)?;
        Ok(CreateOutcome {
            job,
            deduplicated: false,
        })
    }

    async fn get(&self, org: OrganizationId, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND organization_id = $2"
        ))
        .bind(id.as_uuid())
        .bind(org.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(job_from_row).transpose()
    }

    async fn list(
        &self,
        org: OrganizationId,
        filter: &JobFilter,
        page: Pagination,
    ) -> Result<JobPage, StoreError> {
        let status = filter.status.map(|s| s.as_str());
        let job_type = filter.job_type.as_ref().map(|t| t.as_str().to_string());
        let project = filter.project_id.map(|p| *p.as_uuid());

        let count_row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM jobs
            WHERE organization_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR job_type = $3)
              AND ($4::uuid IS NULL OR project_id = $4)
            "#,
        )
        .bind(org.as_uuid())
        .bind(status)
        .bind(job_type.as_deref())
        .bind(project)
        .fetch_one(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        let total: i64 = count_row.try_get("total").map_err(map_sqlx_error)?;

        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE organization_id = $1 \
               AND ($2::text IS NULL OR status = $2) \
               AND ($3::text IS NULL OR job_type = $3) \
               AND ($4::uuid IS NULL OR project_id = $4) \
             ORDER BY created_at DESC \
             LIMIT $5 OFFSET $6"
        ))
        .bind(org.as_uuid())
        .bind(status)
        .bind(job_type.as_deref())
        .bind(project)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let jobs = rows
            .into_iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = total > (page.offset + page.limit) as i64;

        Ok(JobPage {
            jobs,
            total: total as u64,
            has_more,
        })
    }

    async fn stats(&self, org: OrganizationId) -> Result<JobStats, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM jobs WHERE organization_id = $1 GROUP BY status",
        )
        .bind(org.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(map_sqlx_error)?;
            let total: i64 = row.try_get("total").map_err(map_sqlx_error)?;
            let total = total as u64;
            match JobStatus::from_str(&status).map_err(StoreError::from)? {
                JobStatus::Pending => stats.pending = total,
                JobStatus::Running => stats.running = total,
                JobStatus::Completed => stats.completed = total,
                JobStatus::Failed => stats.failed = total,
                JobStatus::Dead => stats.dead = total,
                JobStatus::Cancelled => stats.cancelled = total,
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self, allowed_types), fields(worker_id = %worker_id), err)]
    async fn claim_next(
        &self,
        worker_id: WorkerId,
        allowed_types: Option<&[JobType]>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let types: Option<Vec<String>> = allowed_types
            .map(|types| types.iter().map(|t| t.as_str().to_string()).collect());

        let row = sqlx::query(&format!(
            "UPDATE jobs \
             SET status = 'running', worker_id = $1, started_at = $2, error = NULL \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status = 'pending' AND scheduled_at <= $2 \
                   AND ($3::text[] IS NULL OR job_type = ANY($3)) \
                 ORDER BY priority DESC, scheduled_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
               AND status = 'pending' \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(worker_id.as_uuid())
        .bind(now)
        .bind(types.as_deref())
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(job_from_row).transpose()
    }

    #[instrument(skip(self, result), fields(job_id = %id), err)]
    async fn complete(
        &self,
        id: JobId,
        worker_id: WorkerId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', result = $3, completed_at = $4, worker_id = NULL
            WHERE id = $1 AND status = 'running' AND worker_id = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker_id.as_uuid())
        .bind(result)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn fail(
        &self,
        id: JobId,
        worker_id: WorkerId,
        error: &str,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let owned = sqlx::query(
            "SELECT organization_id, job_type FROM jobs \
             WHERE id = $1 AND status = 'running' AND worker_id = $2 \
             FOR UPDATE",
        )
        .bind(id.as_uuid())
        .bind(worker_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let Some(owned) = owned else {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(FailOutcome::Lost);
        };

        let outcome = match decision {
            RetryDecision::Retry { at } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'pending', attempt_count = attempt_count + 1, error = $2,
                        scheduled_at = $3, worker_id = NULL, started_at = NULL, progress = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(id.as_uuid())
                .bind(error)
                .bind(at)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
                FailOutcome::Scheduled { retry_at: at }
            }
            RetryDecision::Dead => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'dead', attempt_count = attempt_count + 1, error = $2,
                        completed_at = $3, worker_id = NULL, progress = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(id.as_uuid())
                .bind(error)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

                let organization_id: uuid::Uuid =
                    owned.try_get("organization_id").map_err(map_sqlx_error)?;
                let job_type: String = owned.try_get("job_type").map_err(map_sqlx_error)?;
                let entry = DeadLetterEntry::new(
                    id,
                    OrganizationId::from_uuid(organization_id),
                    JobType::new(job_type).map_err(StoreError::from)?,
                    error,
                    now,
                );

                // The unique job_id constraint makes this exactly-once.
                sqlx::query(
                    r#"
                    INSERT INTO dead_letter_entries (
                        id, job_id, organization_id, job_type, error, created_at, resolved
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, FALSE)
                    "#,
                )
                .bind(entry.id.as_uuid())
                .bind(entry.job_id.as_uuid())
                .bind(entry.organization_id.as_uuid())
                .bind(entry.job_type.as_str())
                .bind(&entry.error)
                .bind(entry.created_at)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

                FailOutcome::Dead(entry)
            }
        };

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn cancel(
        &self,
        org: OrganizationId,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE jobs \
             SET status = 'cancelled', completed_at = $3, worker_id = NULL \
             WHERE id = $1 AND organization_id = $2 AND status IN ('pending', 'running') \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(org.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => job_from_row(row),
            None => Err(self.transition_miss(org, id, "cancel").await),
        }
    }

    async fn change_priority(
        &self,
        org: OrganizationId,
        id: JobId,
        priority: JobPriority,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE jobs SET priority = $3 \
             WHERE id = $1 AND organization_id = $2 AND status = 'pending' \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(org.as_uuid())
        .bind(priority.as_i16())
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => job_from_row(row),
            None => Err(self.transition_miss(org, id, "change priority").await),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry_job(
        &self,
        org: OrganizationId,
        id: JobId,
        requested_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE id = $1 AND organization_id = $2 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .bind(org.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let job = row.map(job_from_row).transpose()?.ok_or(StoreError::NotFound)?;

        match job.status {
            JobStatus::Failed => {
                let row = sqlx::query(&format!(
                    "UPDATE jobs \
                     SET status = 'pending', scheduled_at = $2, started_at = NULL \
                     WHERE id = $1 \
                     RETURNING {JOB_COLUMNS}"
                ))
                .bind(id.as_uuid())
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
                let job = job_from_row(row)?;
                tx.commit().await.map_err(map_sqlx_error)?;
                Ok(job)
            }
            JobStatus::Dead => {
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
                insert_job(&mut *tx, &lineage).await.map_err(map_sqlx_error)?;
                tx.commit().await.map_err(map_sqlx_error)?;
                Ok(lineage)
            }
            other => {
                tx.rollback().await.map_err(map_sqlx_error)?;
                Err(StoreError::InvalidTransition(format!(
                    "only failed or dead jobs can be retried (status {other})"
                )))
            }
        }
    }

    async fn set_progress(
        &self,
        id: JobId,
        worker_id: WorkerId,
        progress: u8,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "UPDATE jobs SET progress = $3 \
             WHERE id = $1 AND status = 'running' AND worker_id = $2",
        )
        .bind(id.as_uuid())
        .bind(worker_id.as_uuid())
        .bind(i16::from(progress.min(100)))
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(done.rows_affected() == 1)
    }

    async fn requeue_due_retries(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL \
             WHERE status = 'failed' AND scheduled_at <= $1",
        )
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(done.rows_affected())
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "DELETE FROM jobs \
             WHERE status IN ('completed', 'cancelled') AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(done.rows_affected())
    }

    async fn create_schedule(&self, schedule: JobSchedule) -> Result<JobSchedule, StoreError> {
        let spec = serde_json::to_value(&schedule.spec)
            .map_err(|e| StoreError::Storage(format!("failed to serialize spec: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO job_schedules (
                id, organization_id, created_by, name, job_type, payload, priority,
                spec, next_run_at, is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(schedule.id.as_uuid())
        .bind(schedule.organization_id.as_uuid())
        .bind(schedule.created_by.as_uuid())
        .bind(&schedule.name)
        .bind(schedule.job_type.as_str())
        .bind(&schedule.payload)
        .bind(schedule.priority.as_i16())
        .bind(spec)
        .bind(schedule.next_run_at)
        .bind(schedule.is_active)
        .bind(schedule.created_at)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(schedule)
    }

    async fn list_schedules(&self, org: OrganizationId) -> Result<Vec<JobSchedule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM job_schedules \
             WHERE organization_id = $1 ORDER BY created_at ASC"
        ))
        .bind(org.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.into_iter().map(schedule_from_row).collect()
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<JobSchedule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM job_schedules \
             WHERE is_active AND next_run_at <= $1 ORDER BY next_run_at ASC"
        ))
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.into_iter().map(schedule_from_row).collect()
    }

    async fn advance_schedule(
        &self,
        id: ScheduleId,
        seen_next_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "UPDATE job_schedules SET next_run_at = $3, last_run_at = $4 \
             WHERE id = $1 AND next_run_at = $2",
        )
        .bind(id.as_uuid())
        .bind(seen_next_run_at)
        .bind(next_run_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(done.rows_affected() == 1)
    }

    async fn set_schedule_active(
        &self,
        org: OrganizationId,
        id: ScheduleId,
        active: bool,
    ) -> Result<JobSchedule, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE job_schedules SET is_active = $3 \
             WHERE id = $1 AND organization_id = $2 \
             RETURNING {SCHEDULE_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(org.as_uuid())
        .bind(active)
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.map(schedule_from_row).transpose()?.ok_or(StoreError::NotFound)
    }

    async fn list_dead_letters(
        &self,
        org: OrganizationId,
        resolved: Option<bool>,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_entries \
             WHERE organization_id = $1 AND ($2::boolean IS NULL OR resolved = $2) \
             ORDER BY created_at DESC \
             LIMIT $3 OFFSET $4"
        ))
        .bind(org.as_uuid())
        .bind(resolved)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.into_iter().map(dead_letter_from_row).collect()
    }

    async fn resolve_dead_letter(
        &self,
        org: OrganizationId,
        id: DeadLetterId,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterEntry, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE dead_letter_entries \
             SET resolved = TRUE, resolved_at = $3, resolution_note = $4 \
             WHERE id = $1 AND organization_id = $2 AND NOT resolved \
             RETURNING {DEAD_LETTER_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(org.as_uuid())
        .bind(now)
        .bind(note)
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => dead_letter_from_row(row),
            None => {
                let exists = sqlx::query(
                    "SELECT 1 FROM dead_letter_entries WHERE id = $1 AND organization_id = $2",
                )
                .bind(id.as_uuid())
                .bind(org.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(map_sqlx_error)?;
                if exists.is_some() {
                    Err(StoreError::Conflict("entry is already resolved".to_string()))
                } else {
                    Err(StoreError::NotFound)
                }
            }
        }
    }
}

impl PostgresJobStore {
    /// Distinguish "no such job" from "wrong state" after a guarded update
    /// matched nothing.
    async fn transition_miss(&self, org: OrganizationId, id: JobId, op: &str) -> StoreError {
        let current = sqlx::query("SELECT status FROM jobs WHERE id = $1 AND organization_id = $2")
            .bind(id.as_uuid())
            .bind(org.as_uuid())
            .fetch_optional(&*self.pool)
            .await;
        match current {
            Ok(Some(row)) => {
                let status: String = row.try_get("status").unwrap_or_default();
                StoreError::InvalidTransition(format!("cannot {op} a {status} job"))
            }
            Ok(None) => StoreError::NotFound,
            Err(e) => map_sqlx_error(e),
        }
    }
}

async fn insert_job<'e, E>(executor: E, job: &Job) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, organization_id, created_by, project_id, job_type, name, status,
            priority, payload, created_at, scheduled_at, attempt_count,
            max_attempts, timeout_seconds, idempotency_key, retry_of
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.organization_id.as_uuid())
    .bind(job.created_by.as_uuid())
    .bind(job.project_id.map(|p| *p.as_uuid()))
    .bind(job.job_type.as_str())
    .bind(&job.name)
    .bind(job.status.as_str())
    .bind(job.priority.as_i16())
    .bind(&job.payload)
    .bind(job.created_at)
    .bind(job.scheduled_at)
    .bind(job.attempt_count as i32)
    .bind(job.max_attempts as i32)
    .bind(job.timeout_seconds as i32)
    .bind(job.idempotency_key.as_deref())
    .bind(job.retry_of.map(|j| *j.as_uuid()))
    .execute(executor)
    .await
    .map(|_| ())
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error: {}", db_err.message());
            if db_err.code().as_deref() == Some("23505") {
                StoreError::Conflict(msg)
            } else {
                StoreError::Storage(msg)
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Storage(format!("sqlx error: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

// SQLx row mapping

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    organization_id: uuid::Uuid,
    created_by: uuid::Uuid,
    project_id: Option<uuid::Uuid>,
    job_type: String,
    name: String,
    status: String,
    priority: i16,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    max_attempts: i32,
    timeout_seconds: i32,
    worker_id: Option<uuid::Uuid>,
    progress: Option<i16>,
    result: Option<serde_json::Value>,
    error: Option<String>,
    idempotency_key: Option<String>,
    retry_of: Option<uuid::Uuid>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            created_by: row.try_get("created_by")?,
            project_id: row.try_get("project_id")?,
            job_type: row.try_get("job_type")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            worker_id: row.try_get("worker_id")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            idempotency_key: row.try_get("idempotency_key")?,
            retry_of: row.try_get("retry_of")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let map_domain = |e: DomainError| StoreError::Storage(format!("corrupt job row: {e}"));
        Ok(Job {
            id: JobId::from_uuid(row.id),
            organization_id: OrganizationId::from_uuid(row.organization_id),
            created_by: UserId::from_uuid(row.created_by),
            project_id: row.project_id.map(ProjectId::from_uuid),
            job_type: JobType::new(row.job_type).map_err(map_domain)?,
            name: row.name,
            status: JobStatus::from_str(&row.status).map_err(map_domain)?,
            priority: JobPriority::from_i16(row.priority).map_err(map_domain)?,
            payload: row.payload,
            created_at: row.created_at,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            timeout_seconds: row.timeout_seconds.max(0) as u32,
            worker_id: row.worker_id.map(WorkerId::from_uuid),
            progress: row.progress.map(|p| p.clamp(0, 100) as u8),
            result: row.result,
            error: row.error,
            idempotency_key: row.idempotency_key,
            retry_of: row.retry_of.map(JobId::from_uuid),
        })
    }
}

fn job_from_row(row: sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let row = JobRow::from_row(&row).map_err(map_sqlx_error)?;
    Job::try_from(row)
}

fn schedule_from_row(row: sqlx::postgres::PgRow) -> Result<JobSchedule, StoreError> {
    let map_domain = |e: DomainError| StoreError::Storage(format!("corrupt schedule row: {e}"));
    let spec: serde_json::Value = row.try_get("spec").map_err(map_sqlx_error)?;
    let spec: ScheduleSpec = serde_json::from_value(spec)
        .map_err(|e| StoreError::Storage(format!("corrupt schedule spec: {e}")))?;
    let job_type: String = row.try_get("job_type").map_err(map_sqlx_error)?;
    let priority: i16 = row.try_get("priority").map_err(map_sqlx_error)?;

    Ok(JobSchedule {
        id: ScheduleId::from_uuid(row.try_get("id").map_err(map_sqlx_error)?),
        organization_id: OrganizationId::from_uuid(
            row.try_get("organization_id").map_err(map_sqlx_error)?,
        ),
        created_by: UserId::from_uuid(row.try_get("created_by").map_err(map_sqlx_error)?),
        name: row.try_get("name").map_err(map_sqlx_error)?,
        job_type: JobType::new(job_type).map_err(map_domain)?,
        payload: row.try_get("payload").map_err(map_sqlx_error)?,
        priority: JobPriority::from_i16(priority).map_err(map_domain)?,
        spec,
        next_run_at: row.try_get("next_run_at").map_err(map_sqlx_error)?,
        is_active: row.try_get("is_active").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        last_run_at: row.try_get("last_run_at").map_err(map_sqlx_error)?,
    })
}

fn dead_letter_from_row(row: sqlx::postgres::PgRow) -> Result<DeadLetterEntry, StoreError> {
    let map_domain = |e: DomainError| StoreError::Storage(format!("corrupt dead-letter row: {e}"));
    let job_type: String = row.try_get("job_type").map_err(map_sqlx_error)?;
    Ok(DeadLetterEntry {
        id: DeadLetterId::from_uuid(row.try_get("id").map_err(map_sqlx_error)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(map_sqlx_error)?),
        organization_id: OrganizationId::from_uuid(
            row.try_get("organization_id").map_err(map_sqlx_error)?,
        ),
        job_type: JobType::new(job_type).map_err(map_domain)?,
        error: row.try_get("error").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        resolved: row.try_get("resolved").map_err(map_sqlx_error)?,
        resolved_at: row.try_get("resolved_at").map_err(map_sqlx_error)?,
        resolution_note: row.try_get("resolution_note").map_err(map_sqlx_error)?,
    })
}
