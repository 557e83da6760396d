//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (store, logger, runner, scheduler)
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use jobforge_queue::HandlerRegistry;

use crate::config::AppConfig;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// `registry` carries the deployment's job handlers; the queue itself only
/// defines the dispatch contract.
pub async fn build_app(config: AppConfig, registry: HandlerRegistry) -> anyhow::Result<Router> {
    let jwt = Arc::new(jobforge_auth::Hs256JwtValidator::new(
        config.jwt_secret.as_bytes(),
    ));
    let auth_state = middleware::AuthState { jwt };

    let services = Arc::new(services::build_services(&config, registry).await?);
    let trigger_auth = Arc::new(routes::processing::TriggerAuth::new(
        config.processing_secret.clone(),
        config.environment,
    ));

    // Protected routes: require end-user auth + organization context.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    // The batch trigger authenticates with its own shared secret.
    let processing = routes::processing::router()
        .layer(Extension(services))
        .layer(Extension(trigger_auth));

    Ok(Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .merge(processing)
        .layer(ServiceBuilder::new()))
}
