//! Append-only per-job event trail.
//!
//! `append` is best-effort and fire-and-forget: a logging failure must
//! never fail the operation it is documenting, so implementations swallow
//! errors after reporting them via `tracing`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::Row;
use tracing::warn;

use jobforge_core::{JobId, JobLogEntry, LogLevel, NewLogEntry};

use super::store::StoreError;

#[async_trait]
pub trait JobLogger: Send + Sync {
    /// Append an entry to the job's trail. Never fails the caller.
    async fn append(&self, entry: NewLogEntry);

    /// The full trail, strictly ordered by creation.
    async fn trail(&self, job_id: JobId) -> Result<Vec<JobLogEntry>, StoreError>;
}

/// In-memory logger for tests and development.
#[derive(Debug, Default)]
pub struct InMemoryJobLogger {
    entries: Mutex<Vec<JobLogEntry>>,
    seq: AtomicI64,
}

impl InMemoryJobLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLogger for InMemoryJobLogger {
    async fn append(&self, entry: NewLogEntry) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(JobLogEntry {
            seq,
            job_id: entry.job_id,
            level: entry.level,
            message: entry.message,
            data: entry.data,
            created_at: Utc::now(),
        });
    }

    async fn trail(&self, job_id: JobId) -> Result<Vec<JobLogEntry>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}

/// Durable logger writing to `job_log_entries`.
#[derive(Debug, Clone)]
pub struct PostgresJobLogger {
    pool: PgPool,
}

impl PostgresJobLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobLogger for PostgresJobLogger {
    async fn append(&self, entry: NewLogEntry) {
        let outcome = sqlx::query(
            r#"
            INSERT INTO job_log_entries (job_id, level, message, data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.job_id.as_uuid())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        if let Err(e) = outcome {
            warn!(job_id = %entry.job_id, error = %e, "failed to append job log entry");
        }
    }

    async fn trail(&self, job_id: JobId) -> Result<Vec<JobLogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT seq, job_id, level, message, data, created_at \
             FROM job_log_entries WHERE job_id = $1 ORDER BY seq ASC",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("failed to load job trail: {e}")))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let level: String = row
                .try_get("level")
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            entries.push(JobLogEntry {
                seq: row
                    .try_get("seq")
                    .map_err(|e| StoreError::Storage(e.to_string()))?,
                job_id: JobId::from_uuid(
                    row.try_get("job_id")
                        .map_err(|e| StoreError::Storage(e.to_string()))?,
                ),
                level: level
                    .parse::<LogLevel>()
                    .map_err(|e| StoreError::Storage(format!("corrupt log level: {e}")))?,
                message: row
                    .try_get("message")
                    .map_err(|e| StoreError::Storage(e.to_string()))?,
                data: row
                    .try_get("data")
                    .map_err(|e| StoreError::Storage(e.to_string()))?,
                created_at: row
                    .try_get("created_at")
                    .map_err(|e| StoreError::Storage(e.to_string()))?,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trail_preserves_append_order() {
        let logger = InMemoryJobLogger::new();
        let job_id = JobId::new();
        let other = JobId::new();

        logger
            .append(NewLogEntry::new(job_id, LogLevel::Info, "claimed"))
            .await;
        logger
            .append(NewLogEntry::new(other, LogLevel::Info, "claimed"))
            .await;
        logger
            .append(
                NewLogEntry::new(job_id, LogLevel::Error, "failed")
                    .with_data(serde_json::json!({"attempt": 1})),
            )
            .await;

        let trail = logger.trail(job_id).await.unwrap();
        assert_eq!(trail.len(), 2);
        assert!(trail[0].seq < trail[1].seq);
        assert_eq!(trail[0].message, "claimed");
        assert_eq!(trail[1].message, "failed");
        assert_eq!(
            trail[1].data,
            Some(serde_json::json!({"attempt": 1}))
        );
    }
}
