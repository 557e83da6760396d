//! The batch-processing trigger.
//!
//! Work is driven by repeated external invocations of this endpoint (e.g.
//! a periodic scheduler hitting it); each invocation runs one bounded
//! claim-execute-update batch plus the requested maintenance sweeps.
//! Concurrent invocations are safe: correctness rests on the store's atomic
//! claim primitive, not on mutual exclusion here.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use chrono::Utc;
use tracing::error;

use jobforge_auth::ProcessingSecret;
use jobforge_queue::BatchOptions;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::config::Environment;

pub const SECRET_HEADER: &str = "x-processing-secret";

/// Shared-secret gate for the trigger; distinct from end-user auth.
pub struct TriggerAuth {
    secret: ProcessingSecret,
    environment: Environment,
}

impl TriggerAuth {
    pub fn new(secret: ProcessingSecret, environment: Environment) -> Self {
        Self {
            secret,
            environment,
        }
    }

    fn check(&self, headers: &HeaderMap) -> Result<(), axum::response::Response> {
        // Startup validation already rejects this, but a weak secret must
        // never silently allow processing in production.
        if self.environment.is_production() && !self.secret.is_production_grade() {
            error!("processing trigger refused: secret is not production grade");
            return Err(errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                "processing secret is not production grade",
            ));
        }

        let presented = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented.is_empty() || !self.secret.verify(presented.as_bytes()) {
            return Err(errors::json_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid processing secret",
            ));
        }
        Ok(())
    }
}

pub fn router() -> Router {
    Router::new().route("/processing/run", post(run))
}

pub async fn run(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<Arc<TriggerAuth>>,
    headers: HeaderMap,
    Json(body): Json<dto::ProcessingRequest>,
) -> axum::response::Response {
    if let Err(resp) = auth.check(&headers) {
        return resp;
    }

    let mut allowed_types = None;
    if let Some(types) = &body.job_types {
        let mut parsed = Vec::with_capacity(types.len());
        for raw in types {
            match dto::parse_job_type(raw) {
                Ok(t) => parsed.push(t),
                Err(resp) => return resp,
            }
        }
        allowed_types = Some(parsed);
    }

    let started = Instant::now();
    let now = Utc::now();
    let mut schedules_materialized = 0;
    let mut retried = 0;
    let mut cleaned = 0;

    if body.process_schedules {
        schedules_materialized = match services.scheduler().process_schedules(now).await {
            Ok(count) => count,
            Err(e) => return errors::store_error_to_response(e),
        };
    }

    if body.retry_failed {
        retried = match services.scheduler().retry_pending_jobs(now).await {
            Ok(count) => count,
            Err(e) => return errors::store_error_to_response(e),
        };
    }

    let report = match services
        .runner()
        .run_batch(BatchOptions {
            max_jobs: body.max_jobs.unwrap_or(10).clamp(1, 100),
            allowed_types,
        })
        .await
    {
        Ok(report) => report,
        Err(e) => return errors::store_error_to_response(e),
    };

    if body.cleanup {
        cleaned = match services.scheduler().cleanup_jobs(Utc::now()).await {
            Ok(count) => count,
            Err(e) => return errors::store_error_to_response(e),
        };
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "outcomes": report.outcomes,
            "claimed": report.claimed,
            "completed": report.completed,
            "retrying": report.retrying,
            "dead": report.dead,
            "superseded": report.superseded,
            "schedules_materialized": schedules_materialized,
            "retried": retried,
            "cleaned": cleaned,
            "duration_ms": started.elapsed().as_millis() as u64,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers_with_secret(secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, HeaderValue::from_str(secret).unwrap());
        headers
    }

    #[test]
    fn correct_secret_passes() {
        let auth = TriggerAuth::new(
            ProcessingSecret::new("a-long-enough-processing-secret!"),
            Environment::Development,
        );
        assert!(auth.check(&headers_with_secret("a-long-enough-processing-secret!")).is_ok());
    }

    #[test]
    fn missing_or_wrong_secret_is_unauthorized() {
        let auth = TriggerAuth::new(
            ProcessingSecret::new("a-long-enough-processing-secret!"),
            Environment::Development,
        );
        let denied = auth.check(&HeaderMap::new()).unwrap_err();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let denied = auth.check(&headers_with_secret("wrong")).unwrap_err();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn weak_secret_in_production_never_silently_allows() {
        let auth = TriggerAuth::new(
            ProcessingSecret::new("dev-secret"),
            Environment::Production,
        );
        // Even the matching credential is refused: this is a configuration
        // error, not an authorization success.
        let denied = auth.check(&headers_with_secret("dev-secret")).unwrap_err();
        assert_eq!(denied.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn weak_secret_is_fine_outside_production() {
        let auth = TriggerAuth::new(
            ProcessingSecret::new("dev-secret"),
            Environment::Development,
        );
        assert!(auth.check(&headers_with_secret("dev-secret")).is_ok());
    }
}
