//! Result endpoint.
//!
//! ```text
//! GET /api/v1/async_background_response/:task_id/
//! ```
//!
//! | state | status | body |
//! |-------|--------|------|
//! | completed | 200 | replay outcome |
//! | failed | 200 | `{"status": "failed", "error": "..."}` |
//! | processing | 202 | `{"status": "processing"}` |
//!
//! Callers without identity get 401, unknown tasks 404, and tasks owned by
//! another channel 403, whatever their state.

use crate::error::AppError;
use crate::state::DeferredState;
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use deferred_core::{TaskId, TaskStatus};
use serde_json::{json, Value};

/// Route template of the result endpoint.
pub const RESULT_ROUTE: &str = "/api/v1/async_background_response/:task_id/";

/// Message of the 403 returned to non-owners.
pub const PERMISSION_DENIED: &str = "Permission denied: check access";

/// Return the current state of a deferred task to its owner.
///
/// # Errors
///
/// Returns [`AppError`] with 401, 403, 404, or 500 when the store fails.
pub async fn get_result(
    State(state): State<DeferredState>,
    Path(task_id): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    let (parts, _) = request.into_parts();
    let channel = state.resolver.resolve(&parts).await?;

    let Ok(id) = task_id.parse::<TaskId>() else {
        return Err(AppError::not_found("Task", &task_id));
    };

    let record = state
        .store
        .get(id)
        .await
        .map_err(|e| AppError::internal("Failed to read task status").with_source(e.into()))?
        .ok_or_else(|| AppError::not_found("Task", id))?;

    if record.channel_name.as_deref() != Some(channel.as_str()) {
        tracing::info!(task_id = %id, channel = %channel, "Task result requested by non-owner");
        return Err(AppError::forbidden(PERMISSION_DENIED));
    }

    let response = match record.status {
        TaskStatus::Completed => {
            (StatusCode::OK, Json(record.response.unwrap_or(Value::Null))).into_response()
        },
        TaskStatus::Failed => {
            let error = record.error().unwrap_or("unknown error").to_string();
            (StatusCode::OK, Json(json!({"status": "failed", "error": error}))).into_response()
        },
        TaskStatus::Processing => {
            (StatusCode::ACCEPTED, Json(json!({"status": "processing"}))).into_response()
        },
    };
    Ok(response)
}
