use axum::Router;

pub mod dead_letters;
pub mod jobs;
pub mod processing;
pub mod schedules;
pub mod system;

/// Router for all authenticated (organization-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/schedules", schedules::router())
        .nest("/dead-letters", dead_letters::router())
}
