use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;

use jobforge_core::{JobId, NewJob, ProjectId};
use jobforge_queue::{JobFilter, Pagination};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/retry", post(retry_job))
        .route("/:id/priority", post(change_priority))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Extension(principal): Extension<crate::context::PrincipalContext>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let job_type = match dto::parse_job_type(&body.job_type) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut new = NewJob::new(org.organization_id(), principal.user_id(), job_type, body.name)
        .with_payload(body.payload);
    if let Some(priority) = body.priority.as_deref() {
        new = match dto::parse_priority(priority) {
            Ok(p) => new.with_priority(p),
            Err(resp) => return resp,
        };
    }
    if let Some(project_id) = body.project_id {
        new = new.with_project(ProjectId::from_uuid(project_id));
    }
    if let Some(at) = body.scheduled_at {
        new = new.with_scheduled_at(at);
    }
    if let Some(seconds) = body.timeout_seconds {
        new = new.with_timeout_seconds(seconds);
    }
    if let Some(attempts) = body.max_attempts {
        new = new.with_max_attempts(attempts);
    }
    if let Some(key) = body.idempotency_key {
        new = new.with_idempotency_key(key);
    }

    // Malformed submissions are rejected here, before anything is enqueued.
    if let Err(e) = new.validate() {
        return errors::domain_error_to_response(e);
    }

    let outcome = match services.store().create(new, Utc::now()).await {
        Ok(outcome) => outcome,
        Err(e) => return errors::store_error_to_response(e),
    };

    let status = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (
        status,
        Json(serde_json::json!({
            "job": dto::job_to_json(&outcome.job),
            "deduplicated": outcome.deduplicated,
        })),
    )
        .into_response()
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let mut filter = JobFilter {
        project_id: query.project_id.map(ProjectId::from_uuid),
        ..Default::default()
    };
    if let Some(status) = query.status.as_deref() {
        filter.status = match status.parse() {
            Ok(s) => Some(s),
            Err(e) => return errors::domain_error_to_response(e),
        };
    }
    if let Some(job_type) = query.job_type.as_deref() {
        filter.job_type = match dto::parse_job_type(job_type) {
            Ok(t) => Some(t),
            Err(resp) => return resp,
        };
    }

    let page = Pagination::clamped(query.limit, query.offset);
    match services.store().list(org.organization_id(), &filter, page).await {
        Ok(page) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "items": page.jobs.iter().map(dto::job_to_json).collect::<Vec<_>>(),
                "total": page.total,
                "has_more": page.has_more,
            })),
        )
            .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn job_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
) -> axum::response::Response {
    match services.store().stats(org.organization_id()).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    let job = match services.store().get(org.organization_id(), id).await {
        Ok(Some(job)) => job,
        Ok(None) => return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => return errors::store_error_to_response(e),
    };

    let log = match services.logger().trail(id).await {
        Ok(entries) => entries,
        Err(e) => return errors::store_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "job": dto::job_to_json(&job),
            "log": log.iter().map(dto::log_entry_to_json).collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services.store().cancel(org.organization_id(), id, Utc::now()).await {
        Ok(job) => (StatusCode::OK, Json(dto::job_to_json(&job))).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Extension(principal): Extension<crate::context::PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services
        .store()
        .retry_job(org.organization_id(), id, principal.user_id(), Utc::now())
        .await
    {
        Ok(job) => {
            // A dead job yields a fresh lineage job; a failed one is
            // re-surfaced in place.
            let status = if job.id == id {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(dto::job_to_json(&job))).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn change_priority(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ChangePriorityRequest>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };
    let priority = match dto::parse_priority(&body.priority) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match services
        .store()
        .change_priority(org.organization_id(), id, priority)
        .await
    {
        Ok(job) => (StatusCode::OK, Json(dto::job_to_json(&job))).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
