use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;

use jobforge_core::DeadLetterId;
use jobforge_queue::Pagination;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_dead_letters))
        .route("/:id/resolve", post(resolve_dead_letter))
}

pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Query(query): Query<dto::ListDeadLettersQuery>,
) -> axum::response::Response {
    let page = Pagination::clamped(query.limit, query.offset);
    match services
        .store()
        .list_dead_letters(org.organization_id(), query.resolved, page)
        .await
    {
        Ok(entries) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "items": entries.iter().map(dto::dead_letter_to_json).collect::<Vec<_>>(),
            })),
        )
            .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn resolve_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<crate::context::OrgContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::ResolveDeadLetterRequest>,
) -> axum::response::Response {
    let id: DeadLetterId = match id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_id",
                "invalid dead-letter id",
            );
        }
    };
    if body.note.trim().is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "note must not be empty",
        );
    }

    // Resolution is triage bookkeeping: the underlying job stays dead.
    match services
        .store()
        .resolve_dead_letter(org.organization_id(), id, &body.note, Utc::now())
        .await
    {
        Ok(entry) => (StatusCode::OK, Json(dto::dead_letter_to_json(&entry))).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
