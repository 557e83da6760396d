//! The claim/dispatch loop.
//!
//! Each invocation processes a bounded batch: claim one job at a time,
//! dispatch it to the handler registered for its type under a hard
//! deadline, and report the outcome to the store. Handler failures of any
//! kind (returned errors, panics, timeouts) are caught at the dispatch
//! boundary and handed to the retry manager; they never crash the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use jobforge_core::{Job, JobId, JobStatus, JobType, LogLevel, NewLogEntry, WorkerId};

use super::logger::JobLogger;
use super::retry::RetryManager;
use super::store::{FailOutcome, JobStore, StoreError};

/// Failure surfaced by (or around) a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler exceeded its {0}s deadline")]
    Timeout(u32),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("no handler registered for job type {0:?}")]
    NotRegistered(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Classification recorded in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Failed(_) => "handler_error",
            HandlerError::Timeout(_) => "timeout",
            HandlerError::Panicked(_) => "panic",
            HandlerError::NotRegistered(_) => "handler_missing",
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// Everything a handler gets to see: its job, plus cooperative facilities
/// (progress reporting, cancellation polling, trail logging).
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    worker_id: WorkerId,
    store: Arc<dyn JobStore>,
    logger: Arc<dyn JobLogger>,
}

impl JobContext {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Deserialize the payload into the handler's own schema. This is the
    /// dispatch-boundary validation: a payload that does not match is a
    /// handler failure, not a crash.
    pub fn payload_as<P: serde::de::DeserializeOwned>(&self) -> Result<P, HandlerError> {
        serde_json::from_value(self.job.payload.clone())
            .map_err(|e| HandlerError::Failed(format!("invalid payload: {e}")))
    }

    /// Cancellation is cooperative: long handlers poll this and bail out.
    pub async fn is_cancelled(&self) -> bool {
        match self.store.get(self.job.organization_id, self.job.id).await {
            Ok(Some(job)) => job.status == JobStatus::Cancelled,
            Ok(None) => true,
            Err(e) => {
                warn!(job_id = %self.job.id, error = %e, "cancellation poll failed");
                false
            }
        }
    }

    /// Report progress (0..=100). Best effort.
    pub async fn set_progress(&self, progress: u8) {
        if let Err(e) = self
            .store
            .set_progress(self.job.id, self.worker_id, progress)
            .await
        {
            warn!(job_id = %self.job.id, error = %e, "progress update failed");
        }
    }

    /// Append to the job's trail.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logger
            .append(NewLogEntry::new(self.job.id, level, message))
            .await;
    }
}

/// Contract for one job type. Payload interpretation is entirely the
/// handler's business; the queue only routes and supervises.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> HandlerResult;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send,
{
    async fn run(&self, ctx: JobContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

/// One handler per job type, exact match.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn types(&self) -> Vec<JobType> {
        self.handlers.keys().cloned().collect()
    }
}

/// Options for one batch invocation.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Hard cap on jobs processed this invocation.
    pub max_jobs: usize,
    /// Restrict claims to these types (None = all).
    pub allowed_types: Option<Vec<JobType>>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_jobs: 10,
            allowed_types: None,
        }
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub job_type: String,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Completed,
    /// Failed; requeued with backoff.
    Retrying,
    /// Failed for the last time; dead-lettered.
    Dead,
    /// The job stopped being ours mid-flight (cancelled cooperatively);
    /// the late result was dropped.
    Superseded,
}

/// Summary of one batch invocation.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<JobOutcome>,
    pub claimed: usize,
    pub completed: usize,
    pub retrying: usize,
    pub dead: usize,
    pub superseded: usize,
    pub duration_ms: u64,
}

impl BatchReport {
    fn new(outcomes: Vec<JobOutcome>, elapsed: Duration) -> Self {
        let count = |d: Disposition| outcomes.iter().filter(|o| o.disposition == d).count();
        Self {
            claimed: outcomes.len(),
            completed: count(Disposition::Completed),
            retrying: count(Disposition::Retrying),
            dead: count(Disposition::Dead),
            superseded: count(Disposition::Superseded),
            duration_ms: elapsed.as_millis() as u64,
            outcomes,
        }
    }
}

/// Claims pending jobs and supervises their handlers.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    logger: Arc<dyn JobLogger>,
    retry: RetryManager,
    registry: HandlerRegistry,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        logger: Arc<dyn JobLogger>,
        retry: RetryManager,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            store,
            logger,
            retry,
            registry,
        }
    }

    /// Process one bounded batch. Stops early when no eligible job remains.
    ///
    /// A fresh worker id is generated per invocation and passed explicitly
    /// into every claim. Concurrent invocations are safe: the store's claim
    /// primitive guarantees at most one winner per job.
    pub async fn run_batch(&self, options: BatchOptions) -> Result<BatchReport, StoreError> {
        let worker_id = WorkerId::new();
        let started = Instant::now();
        let mut outcomes = Vec::new();

        for _ in 0..options.max_jobs {
            let now = Utc::now();
            let claimed = self
                .store
                .claim_next(worker_id, options.allowed_types.as_deref(), now)
                .await?;
            let Some(job) = claimed else {
                break;
            };
            outcomes.push(self.run_one(job, worker_id).await?);
        }

        let report = BatchReport::new(outcomes, started.elapsed());
        info!(
            claimed = report.claimed,
            completed = report.completed,
            retrying = report.retrying,
            dead = report.dead,
            duration_ms = report.duration_ms,
            "batch finished"
        );
        Ok(report)
    }

    async fn run_one(&self, job: Job, worker_id: WorkerId) -> Result<JobOutcome, StoreError> {
        let started = Instant::now();
        let attempt = job.attempt_count + 1;

        self.logger
            .append(
                NewLogEntry::new(job.id, LogLevel::Info, "claimed").with_data(serde_json::json!({
                    "worker_id": worker_id,
                    "attempt": attempt,
                    "priority": job.priority,
                })),
            )
            .await;
        debug!(job_id = %job.id, job_type = %job.job_type, attempt, "dispatching");
        self.logger
            .append(
                NewLogEntry::new(job.id, LogLevel::Debug, "dispatching").with_data(
                    serde_json::json!({
                        "job_type": job.job_type,
                        "timeout_seconds": job.timeout_seconds,
                    }),
                ),
            )
            .await;

        let ctx = JobContext {
            job: job.clone(),
            worker_id,
            store: self.store.clone(),
            logger: self.logger.clone(),
        };
        let result = self.dispatch(&job, ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(value) => {
                let acked = self
                    .store
                    .complete(job.id, worker_id, value, Utc::now())
                    .await?;
                if acked {
                    self.logger
                        .append(
                            NewLogEntry::new(job.id, LogLevel::Info, "completed")
                                .with_data(serde_json::json!({"duration_ms": duration_ms})),
                        )
                        .await;
                    JobOutcome {
                        job_id: job.id,
                        job_type: job.job_type.to_string(),
                        disposition: Disposition::Completed,
                        error: None,
                        duration_ms,
                    }
                } else {
                    self.superseded(&job, duration_ms, "result").await
                }
            }
            Err(err) => {
                let decision = self.retry.decide(&job, Utc::now());
                let message = err.to_string();
                match self
                    .store
                    .fail(job.id, worker_id, &message, decision, Utc::now())
                    .await?
                {
                    FailOutcome::Scheduled { retry_at } => {
                        warn!(
                            job_id = %job.id,
                            attempt,
                            kind = err.kind(),
                            error = %message,
                            %retry_at,
                            "attempt failed; retry scheduled"
                        );
                        self.logger
                            .append(
                                NewLogEntry::new(job.id, LogLevel::Warn, "attempt failed")
                                    .with_data(serde_json::json!({
                                        "attempt": attempt,
                                        "kind": err.kind(),
                                        "error": message,
                                        "retry_at": retry_at,
                                        "duration_ms": duration_ms,
                                    })),
                            )
                            .await;
                        JobOutcome {
                            job_id: job.id,
                            job_type: job.job_type.to_string(),
                            disposition: Disposition::Retrying,
                            error: Some(message),
                            duration_ms,
                        }
                    }
                    FailOutcome::Dead(entry) => {
                        error!(
                            job_id = %job.id,
                            attempt,
                            kind = err.kind(),
                            error = %message,
                            dead_letter_id = %entry.id,
                            "retry budget exhausted; job dead-lettered"
                        );
                        self.logger
                            .append(
                                NewLogEntry::new(job.id, LogLevel::Error, "dead-lettered")
                                    .with_data(serde_json::json!({
                                        "attempt": attempt,
                                        "kind": err.kind(),
                                        "error": message,
                                        "dead_letter_id": entry.id,
                                        "duration_ms": duration_ms,
                                    })),
                            )
                            .await;
                        JobOutcome {
                            job_id: job.id,
                            job_type: job.job_type.to_string(),
                            disposition: Disposition::Dead,
                            error: Some(message),
                            duration_ms,
                        }
                    }
                    FailOutcome::Lost => self.superseded(&job, duration_ms, "failure").await,
                }
            }
        };

        Ok(outcome)
    }

    async fn superseded(&self, job: &Job, duration_ms: u64, dropped: &str) -> JobOutcome {
        warn!(
            job_id = %job.id,
            "job no longer owned (cancelled mid-flight); {dropped} dropped"
        );
        self.logger
            .append(NewLogEntry::new(
                job.id,
                LogLevel::Warn,
                format!("late {dropped} dropped; job was cancelled mid-flight"),
            ))
            .await;
        JobOutcome {
            job_id: job.id,
            job_type: job.job_type.to_string(),
            disposition: Disposition::Superseded,
            error: None,
            duration_ms,
        }
    }

    /// Run the handler inside its own task with a hard deadline. The task
    /// boundary also catches panics; on timeout the task is aborted.
    async fn dispatch(&self, job: &Job, ctx: JobContext) -> HandlerResult {
        let Some(handler) = self.registry.get(&job.job_type) else {
            return Err(HandlerError::NotRegistered(job.job_type.to_string()));
        };

        let deadline = Duration::from_secs(u64::from(job.timeout_seconds));
        let task = tokio::spawn(async move { handler.run(ctx).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(HandlerError::Panicked(panic_message(join_err.into_panic())))
            }
            Ok(Err(_)) => Err(HandlerError::Failed("handler task was aborted".to_string())),
            Err(_) => {
                abort.abort();
                Err(HandlerError::Timeout(job.timeout_seconds))
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use jobforge_core::{NewJob, OrganizationId, RetryPolicy, UserId};

    use super::*;
    use crate::logger::InMemoryJobLogger;
    use crate::memory::InMemoryJobStore;
    use crate::store::{JobFilter, JobStore, Pagination};

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        logger: Arc<InMemoryJobLogger>,
        org: OrganizationId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemoryJobStore::arc(),
                logger: Arc::new(InMemoryJobLogger::new()),
                org: OrganizationId::new(),
            }
        }

        fn runner(&self, registry: HandlerRegistry) -> JobRunner {
            JobRunner::new(
                self.store.clone(),
                self.logger.clone(),
                RetryManager::new(RetryPolicy::deterministic(
                    StdDuration::from_secs(30),
                    StdDuration::from_secs(3600),
                )),
                registry,
            )
        }

        async fn submit(&self, job_type: &str, max_attempts: u32, timeout_seconds: u32) -> Job {
            self.store
                .create(
                    NewJob::new(
                        self.org,
                        UserId::new(),
                        JobType::new(job_type).unwrap(),
                        format!("{job_type} job"),
                    )
                    .with_max_attempts(max_attempts)
                    .with_timeout_seconds(timeout_seconds),
                    Utc::now(),
                )
                .await
                .unwrap()
                .job
        }
    }

    fn registry_with(job_type: &str, handler: Arc<dyn JobHandler>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::new(job_type).unwrap(), handler);
        registry
    }

    #[tokio::test]
    async fn successful_job_completes_with_result_and_trail() {
        let fx = Fixture::new();
        let registry = registry_with(
            "export.csv",
            Arc::new(FnHandler(|ctx: JobContext| async move {
                ctx.set_progress(50).await;
                Ok::<_, HandlerError>(serde_json::json!({"rows": 42}))
            })),
        );
        let job = fx.submit("export.csv", 3, 60).await;

        let report = fx
            .runner(registry)
            .run_batch(BatchOptions::default())
            .await
            .unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.outcomes[0].disposition, Disposition::Completed);

        let refreshed = fx.store.get(fx.org, job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Completed);
        assert_eq!(refreshed.result, Some(serde_json::json!({"rows": 42})));

        let trail = fx.logger.trail(job.id).await.unwrap();
        assert!(trail.iter().any(|e| e.message == "claimed"));
        assert!(trail.iter().any(|e| e.message == "completed"));
    }

    #[tokio::test]
    async fn failing_job_is_requeued_with_backoff() {
        let fx = Fixture::new();
        let registry = registry_with(
            "export.csv",
            Arc::new(FnHandler(|_ctx: JobContext| async move {
                Err::<serde_json::Value, _>(HandlerError::failed("upstream 503"))
            })),
        );
        let job = fx.submit("export.csv", 2, 60).await;
        let runner = fx.runner(registry);

        let report = runner.run_batch(BatchOptions::default()).await.unwrap();
        assert_eq!(report.retrying, 1);

        let refreshed = fx.store.get(fx.org, job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Pending);
        assert_eq!(refreshed.attempt_count, 1);
        assert!(refreshed.scheduled_at > Utc::now());
        assert_eq!(refreshed.error.as_deref(), Some("upstream 503"));

        // Not claimable until the backoff elapses.
        let report = runner.run_batch(BatchOptions::default()).await.unwrap();
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered_exactly_once() {
        let fx = Fixture::new();
        let registry = registry_with(
            "export.csv",
            Arc::new(FnHandler(|_ctx: JobContext| async move {
                Err::<serde_json::Value, _>(HandlerError::failed("boom"))
            })),
        );
        let job = fx.submit("export.csv", 1, 60).await;

        let report = fx
            .runner(registry)
            .run_batch(BatchOptions::default())
            .await
            .unwrap();
        assert_eq!(report.dead, 1);

        let refreshed = fx.store.get(fx.org, job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Dead);
        let entries = fx
            .store
            .list_dead_letters(fx.org, None, Pagination::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_hits_the_hard_deadline() {
        let fx = Fixture::new();
        let registry = registry_with(
            "document.extract",
            Arc::new(FnHandler(|_ctx: JobContext| async move {
                tokio::time::sleep(StdDuration::from_secs(3600)).await;
                Ok::<_, HandlerError>(serde_json::Value::Null)
            })),
        );
        let job = fx.submit("document.extract", 3, 5).await;

        let report = fx
            .runner(registry)
            .run_batch(BatchOptions::default())
            .await
            .unwrap();
        assert_eq!(report.retrying, 1);
        let err = report.outcomes[0].error.as_deref().unwrap();
        assert!(err.contains("deadline"), "{err}");

        // A timeout counts toward the retry budget like any other failure.
        let refreshed = fx.store.get(fx.org, job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.attempt_count, 1);
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn run(&self, _ctx: JobContext) -> HandlerResult {
            panic!("index out of bounds");
        }
    }

    #[tokio::test]
    async fn panicking_handler_is_caught_and_retried() {
        let fx = Fixture::new();
        let registry = registry_with("export.csv", Arc::new(PanickingHandler));
        let job = fx.submit("export.csv", 3, 60).await;

        let report = fx
            .runner(registry)
            .run_batch(BatchOptions::default())
            .await
            .unwrap();
        assert_eq!(report.retrying, 1);
        assert!(report.outcomes[0]
            .error
            .as_deref()
            .unwrap()
            .contains("panicked"));
        let refreshed = fx.store.get(fx.org, job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn missing_handler_is_a_normal_failure() {
        let fx = Fixture::new();
        let job = fx.submit("billing.webhook", 1, 60).await;

        let report = fx
            .runner(HandlerRegistry::new())
            .run_batch(BatchOptions::default())
            .await
            .unwrap();
        assert_eq!(report.dead, 1);

        let refreshed = fx.store.get(fx.org, job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Dead);
        assert!(refreshed.error.unwrap().contains("no handler registered"));
    }

    #[tokio::test]
    async fn batch_stops_at_max_jobs() {
        let fx = Fixture::new();
        let registry = registry_with(
            "export.csv",
            Arc::new(FnHandler(|_ctx: JobContext| async move {
                Ok::<_, HandlerError>(serde_json::Value::Null)
            })),
        );
        for _ in 0..8 {
            fx.submit("export.csv", 3, 60).await;
        }

        let report = fx
            .runner(registry)
            .run_batch(BatchOptions {
                max_jobs: 5,
                allowed_types: None,
            })
            .await
            .unwrap();
        assert_eq!(report.claimed, 5);
        assert_eq!(report.completed, 5);

        let page = fx
            .store
            .list(
                fx.org,
                &JobFilter {
                    status: Some(JobStatus::Pending),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn type_filter_limits_what_the_batch_claims() {
        let fx = Fixture::new();
        let registry = registry_with(
            "export.csv",
            Arc::new(FnHandler(|_ctx: JobContext| async move {
                Ok::<_, HandlerError>(serde_json::Value::Null)
            })),
        );
        fx.submit("export.csv", 3, 60).await;
        fx.submit("document.extract", 3, 60).await;

        let report = fx
            .runner(registry)
            .run_batch(BatchOptions {
                max_jobs: 10,
                allowed_types: Some(vec![JobType::new("export.csv").unwrap()]),
            })
            .await
            .unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.outcomes[0].job_type, "export.csv");
    }

    /// Handler that cancels its own job mid-run, simulating an operator
    /// cancelling while the handler is in flight.
    struct SelfCancellingHandler {
        store: Arc<InMemoryJobStore>,
    }

    #[async_trait]
    impl JobHandler for SelfCancellingHandler {
        async fn run(&self, ctx: JobContext) -> HandlerResult {
            self.store
                .cancel(ctx.job().organization_id, ctx.job().id, Utc::now())
                .await
                .map_err(|e| HandlerError::failed(e.to_string()))?;
            assert!(ctx.is_cancelled().await);
            Ok(serde_json::json!({"finished": "anyway"}))
        }
    }

    #[tokio::test]
    async fn cancelled_mid_flight_job_keeps_its_terminal_status() {
        let fx = Fixture::new();
        let mut registry = HandlerRegistry::new();
        registry.register(
            JobType::new("export.csv").unwrap(),
            Arc::new(SelfCancellingHandler {
                store: fx.store.clone(),
            }),
        );
        let job = fx.submit("export.csv", 3, 60).await;

        let report = fx
            .runner(registry)
            .run_batch(BatchOptions::default())
            .await
            .unwrap();
        assert_eq!(report.superseded, 1);

        let refreshed = fx.store.get(fx.org, job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Cancelled);
        assert_eq!(refreshed.result, None);
    }
}
