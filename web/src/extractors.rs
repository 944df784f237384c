//! Custom Axum extractors.
//!
//! - [`RequireDeferred`]: restrict a route to deferred execution
//!
//! # Example
//!
//! ```ignore
//! use deferred_web::extractors::RequireDeferred;
//!
//! async fn recalculate_shop(
//!     _: RequireDeferred,
//!     Path(id): Path<String>,
//!     Json(body): Json<Value>,
//! ) -> Result<Json<Value>, AppError> {
//!     // Long-running work: only ever runs on a consumer.
//!     Ok(Json(body))
//! }
//! ```

use crate::error::AppError;
use crate::middleware::is_replay;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use deferred_core::TRIGGER_HEADER;

/// Message of the 409 returned to synchronous callers.
pub const ASYNC_ONLY_MESSAGE: &str = "This endpoint is available only via async request.";

/// Accepts only requests that are replays or ask for deferral.
///
/// Behind the deferral gate a triggered request never reaches the handler
/// synchronously, so in practice the handler only runs for replays. A plain
/// synchronous call is rejected with 409.
#[derive(Debug, Clone, Copy)]
pub struct RequireDeferred;

#[async_trait]
impl<S> FromRequestParts<S> for RequireDeferred
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if is_replay(&parts.headers) || parts.headers.contains_key(TRIGGER_HEADER) {
            Ok(Self)
        } else {
            Err(AppError::conflict(ASYNC_ONLY_MESSAGE))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use deferred_core::INTERNAL_HEADER;

    async fn extract(request: Request<()>) -> Result<RequireDeferred, AppError> {
        let (mut parts, ()) = request.into_parts();
        RequireDeferred::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_replay_is_accepted() {
        let request = Request::builder()
            .header(INTERNAL_HEADER, "True")
            .body(())
            .unwrap();
        assert!(extract(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_trigger_is_accepted() {
        let request = Request::builder()
            .header(TRIGGER_HEADER, "1")
            .body(())
            .unwrap();
        assert!(extract(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_synchronous_call_is_conflict() {
        let request = Request::builder()
            .header(INTERNAL_HEADER, "false")
            .body(())
            .unwrap();
        let err = extract(request).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.message(), ASYNC_ONLY_MESSAGE);
    }
}
