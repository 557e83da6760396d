use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use jobforge_core::{DeadLetterEntry, Job, JobLogEntry, JobPriority, JobSchedule, JobType};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub job_type: String,
    pub name: String,
    pub priority: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub project_id: Option<uuid::Uuid>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<u32>,
    pub max_attempts: Option<u32>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub project_id: Option<uuid::Uuid>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePriorityRequest {
    pub priority: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub job_type: String,
    pub priority: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub spec: jobforge_core::ScheduleSpec,
}

#[derive(Debug, Deserialize)]
pub struct ListDeadLettersQuery {
    pub resolved: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveDeadLetterRequest {
    pub note: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ProcessingRequest {
    pub job_types: Option<Vec<String>>,
    pub max_jobs: Option<usize>,
    #[serde(default = "default_true")]
    pub process_schedules: bool,
    #[serde(default = "default_true")]
    pub retry_failed: bool,
    #[serde(default)]
    pub cleanup: bool,
}

// -------------------------
// Parse helpers
// -------------------------

pub fn parse_priority(s: &str) -> Result<JobPriority, axum::response::Response> {
    s.parse::<JobPriority>().map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
    })
}

pub fn parse_job_type(s: &str) -> Result<JobType, axum::response::Response> {
    JobType::new(s).map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
    })
}

// -------------------------
// Response mapping
// -------------------------

pub fn job_to_json(job: &Job) -> serde_json::Value {
    json!({
        "id": job.id,
        "organization_id": job.organization_id,
        "created_by": job.created_by,
        "project_id": job.project_id,
        "job_type": job.job_type,
        "name": job.name,
        "status": job.status,
        "priority": job.priority,
        "payload": job.payload,
        "created_at": job.created_at,
        "scheduled_at": job.scheduled_at,
        "started_at": job.started_at,
        "completed_at": job.completed_at,
        "attempt_count": job.attempt_count,
        "max_attempts": job.max_attempts,
        "timeout_seconds": job.timeout_seconds,
        "worker_id": job.worker_id,
        "progress": job.progress,
        "result": job.result,
        "error": job.error,
        "idempotency_key": job.idempotency_key,
        "retry_of": job.retry_of,
    })
}

pub fn schedule_to_json(schedule: &JobSchedule) -> serde_json::Value {
    json!({
        "id": schedule.id,
        "organization_id": schedule.organization_id,
        "name": schedule.name,
        "job_type": schedule.job_type,
        "payload": schedule.payload,
        "priority": schedule.priority,
        "spec": schedule.spec,
        "next_run_at": schedule.next_run_at,
        "is_active": schedule.is_active,
        "created_at": schedule.created_at,
        "last_run_at": schedule.last_run_at,
    })
}

pub fn dead_letter_to_json(entry: &DeadLetterEntry) -> serde_json::Value {
    json!({
        "id": entry.id,
        "job_id": entry.job_id,
        "job_type": entry.job_type,
        "error": entry.error,
        "created_at": entry.created_at,
        "resolved": entry.resolved,
        "resolved_at": entry.resolved_at,
        "resolution_note": entry.resolution_note,
    })
}

pub fn log_entry_to_json(entry: &JobLogEntry) -> serde_json::Value {
    json!({
        "seq": entry.seq,
        "level": entry.level,
        "message": entry.message,
        "data": entry.data,
        "created_at": entry.created_at,
    })
}
