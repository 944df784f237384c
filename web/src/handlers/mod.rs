//! HTTP request handlers.

pub mod health;
pub mod result;

pub use health::{health_check, readiness};
pub use result::{get_result, RESULT_ROUTE};

use crate::state::DeferredState;
use axum::{routing::get, Router};

/// Routes owned by this crate: result endpoint and health checks.
///
/// Merge into the application router *before* installing the gate so the
/// gate sees them like any other route.
pub fn routes(state: DeferredState) -> Router {
    Router::new()
        .route(RESULT_ROUTE, get(get_result))
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness))
        .with_state(state)
}
