//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use crate::state::DeferredState;
use axum::{extract::State, http::StatusCode, Json};
use deferred_core::TaskId;
use serde::Serialize;
use uuid::Uuid;

/// Simple health check endpoint (for basic liveness).
///
/// Returns 200 OK to indicate the service is running.
/// This endpoint does NOT check dependencies.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Readiness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    /// `ready` or `unavailable`.
    pub status: &'static str,
    /// Whether triggered requests are deferred.
    pub deferral_enabled: bool,
    /// Topic deferred requests go to.
    pub topic: String,
    /// Status store reachability (`ok` or the error).
    pub store: String,
}

/// Readiness check: the status store must answer.
///
/// # Status Codes
///
/// - 200 OK: store reachable
/// - 503 Service Unavailable: store read failed
///
/// # Endpoint
///
/// ```text
/// GET /health/ready
/// ```
pub async fn readiness(State(state): State<DeferredState>) -> (StatusCode, Json<ReadinessReport>) {
    let probe = TaskId::from_uuid(Uuid::nil());
    let (status, store) = match state.store.get(probe).await {
        Ok(_) => (StatusCode::OK, "ok".to_string()),
        Err(e) => {
            tracing::warn!(error = %e, "Status store readiness probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        },
    };

    let report = ReadinessReport {
        status: if status.is_success() { "ready" } else { "unavailable" },
        deferral_enabled: state.config.enabled,
        topic: state.config.topic.clone(),
        store,
    };
    (status, Json(report))
}
