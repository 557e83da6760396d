use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use chrono::Utc;

use jobforge_core::{JobPriority, NewSchedule, ScheduleId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_schedule).get(list_schedules))
        .route("/:id/activate", post(activate_schedule))
        .route("/:id/deactivate", post(deactivate_schedule))
}

pub async fn create_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Extension(principal): Extension<crate::context::PrincipalContext>,
    Json(body): Json<dto::CreateScheduleRequest>,
) -> axum::response::Response {
    let job_type = match dto::parse_job_type(&body.job_type) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let priority = match body.priority.as_deref() {
        Some(p) => match dto::parse_priority(p) {
            Ok(p) => p,
            Err(resp) => return resp,
        },
        None => JobPriority::default(),
    };

    let new = NewSchedule {
        organization_id: org.organization_id(),
        created_by: principal.user_id(),
        name: body.name,
        job_type,
        payload: body.payload,
        priority,
        spec: body.spec,
    };

    // Validates the definition and computes the first firing from now.
    let schedule = match new.into_schedule(Utc::now()) {
        Ok(s) => s,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.store().create_schedule(schedule).await {
        Ok(schedule) => (
            StatusCode::CREATED,
            Json(dto::schedule_to_json(&schedule)),
        )
            .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list_schedules(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
) -> axum::response::Response {
    match services.store().list_schedules(org.organization_id()).await {
        Ok(schedules) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "items": schedules.iter().map(dto::schedule_to_json).collect::<Vec<_>>(),
            })),
        )
            .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn activate_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    set_active(services, org, &id, true).await
}

pub async fn deactivate_schedule(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    set_active(services, org, &id, false).await
}

async fn set_active(
    services: Arc<AppServices>,
    org: crate::context::OrgContext,
    id: &str,
    active: bool,
) -> axum::response::Response {
    let id: ScheduleId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid schedule id");
        }
    };

    match services
        .store()
        .set_schedule_active(org.organization_id(), id, active)
        .await
    {
        Ok(schedule) => (StatusCode::OK, Json(dto::schedule_to_json(&schedule))).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
