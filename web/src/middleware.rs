//! Deferral gate: tower middleware in front of the application.
//!
//! Decides per request whether to run it now or to hand it to the broker:
//!
//! 1. **Excluded path** (result endpoint family, configured prefixes) → run now
//! 2. **No trigger header**, or the request is a replay → run now
//! 3. **Deferral disabled** → warn, run now
//! 4. **No caller identity** → 401, nothing published
//! 5. **Body over the limit** → 413, nothing published
//! 6. Capture + publish → 202 with the task id (503 if the broker refused)
//!
//! A deferred request never reaches the inner service; it is replayed later
//! by the consumer side with the marker header set, which makes step 2 let it
//! through.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use deferred_web::middleware::deferral_layer;
//!
//! let app = Router::new()
//!     .route("/api/v1/some-async-endpoint/", get(handler))
//!     .layer(deferral_layer(state));
//! ```

use crate::codec::capture;
use crate::error::AppError;
use crate::state::DeferredState;
use axum::{
    extract::Request,
    http::{header::CONTENT_LENGTH, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use deferred_core::{TaskId, INTERNAL_HEADER, TRIGGER_HEADER};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Body of the 202 response.
///
/// ```json
/// {"data": null, "meta": {"async_request_id": "2526046e-5d7a-41fb-a058-935b602726a9"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredAccepted {
    /// Always `null`.
    pub data: Option<()>,
    /// Ticket of the deferred call.
    pub meta: AcceptedMeta,
}

/// Metadata of a [`DeferredAccepted`] response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedMeta {
    /// Task id to poll the result endpoint with.
    pub async_request_id: TaskId,
}

impl DeferredAccepted {
    /// Acknowledgement for `task_id`.
    #[must_use]
    pub const fn new(task_id: TaskId) -> Self {
        Self {
            data: None,
            meta: AcceptedMeta {
                async_request_id: task_id,
            },
        }
    }
}

/// Create the deferral gate layer.
#[must_use]
pub fn deferral_layer(state: DeferredState) -> DeferralLayer {
    DeferralLayer::new(state)
}

/// Layer installing the deferral gate.
#[derive(Clone)]
pub struct DeferralLayer {
    gate: Arc<Gate>,
}

impl DeferralLayer {
    /// Create the layer.
    #[must_use]
    pub fn new(state: DeferredState) -> Self {
        Self {
            gate: Arc::new(Gate {
                state,
                excluded: OnceLock::new(),
            }),
        }
    }
}

impl<S> Layer<S> for DeferralLayer {
    type Service = DeferralMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeferralMiddleware {
            inner,
            gate: Arc::clone(&self.gate),
        }
    }
}

/// Middleware service of the deferral gate.
#[derive(Clone)]
pub struct DeferralMiddleware<S> {
    inner: S,
    gate: Arc<Gate>,
}

impl<S> Service<Request> for DeferralMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        if !self.gate.should_defer(&req) {
            return Box::pin(self.inner.call(req));
        }

        let gate = Arc::clone(&self.gate);
        Box::pin(async move { Ok(gate.defer(req).await) })
    }
}

struct Gate {
    state: DeferredState,
    // Derived from the config on first request.
    excluded: OnceLock<Vec<String>>,
}

impl Gate {
    fn excluded_prefixes(&self) -> &[String] {
        self.excluded.get_or_init(|| {
            let config = &self.state.config;
            let prefixes: Vec<String> = std::iter::once(exclusion_prefix(&config.result_route))
                .chain(config.excluded_prefixes.iter().map(String::as_str).map(exclusion_prefix))
                .filter(|p| !p.is_empty())
                .collect();
            tracing::debug!(prefixes = ?prefixes, "Deferral exclusion prefixes");
            prefixes
        })
    }

    fn should_defer(&self, req: &Request) -> bool {
        let path = req.uri().path();
        if self
            .excluded_prefixes()
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return false;
        }

        if !requests_deferral(req.headers()) {
            return false;
        }

        if !self.state.config.enabled {
            tracing::warn!(
                path = path,
                "Deferral is disabled, it is impossible to execute the request in the background"
            );
            metrics::counter!("deferred.gate.requests", "outcome" => "disabled").increment(1);
            return false;
        }

        true
    }

    async fn defer(&self, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();

        let channel = match self.state.resolver.resolve(&parts).await {
            Ok(channel) => channel,
            Err(e) => {
                metrics::counter!("deferred.gate.requests", "outcome" => "unauthorized").increment(1);
                tracing::info!(path = %path, error = %e, "Deferred request rejected");
                return AppError::from(e).into_response();
            },
        };

        let limit = self.state.config.max_body_bytes;
        if declared_length(&parts.headers).is_some_and(|len| len > limit) {
            metrics::counter!("deferred.gate.requests", "outcome" => "too_large").increment(1);
            return AppError::payload_too_large(limit).into_response();
        }
        let bytes = match axum::body::to_bytes(body, limit).await {
            Ok(bytes) => bytes,
            Err(e) => {
                metrics::counter!("deferred.gate.requests", "outcome" => "too_large").increment(1);
                tracing::warn!(path = %path, error = %e, limit, "Failed to buffer deferred request body");
                return AppError::payload_too_large(limit).into_response();
            },
        };

        let payload = capture(&parts, &bytes);
        let marker = payload.partition_marker();
        let topic = self.state.config.topic.as_str();

        match self
            .state
            .dispatcher
            .enqueue(topic, &channel, payload, marker)
            .await
        {
            Ok(task_id) => {
                metrics::counter!("deferred.gate.requests", "outcome" => "accepted").increment(1);
                (StatusCode::ACCEPTED, Json(DeferredAccepted::new(task_id))).into_response()
            },
            Err(e) => {
                metrics::counter!("deferred.gate.requests", "outcome" => "dispatch_failed")
                    .increment(1);
                AppError::unavailable("Background execution is temporarily unavailable")
                    .with_source(anyhow::Error::new(e))
                    .into_response()
            },
        }
    }
}

/// Whether the request carries the trigger header and is not a replay.
#[must_use]
pub fn requests_deferral(headers: &HeaderMap) -> bool {
    headers.contains_key(TRIGGER_HEADER) && !is_replay(headers)
}

/// Whether the request carries the replay marker (`true`, any case).
#[must_use]
pub fn is_replay(headers: &HeaderMap) -> bool {
    headers
        .get(INTERNAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Path prefix matched by a route template.
///
/// Everything up to the first parameter segment (`:id`, `{id}`, `*rest`),
/// with duplicate slashes collapsed:
/// `/api/v1/async_background_response/:task_id/` → `/api/v1/async_background_response/`.
#[must_use]
pub fn exclusion_prefix(route_template: &str) -> String {
    let mut offset = 0;
    let mut cut = route_template.len();
    for segment in route_template.split('/') {
        if segment.starts_with([':', '{', '*']) {
            cut = offset;
            break;
        }
        offset += segment.len() + 1;
    }
    collapse_slashes(&route_template[..cut])
}

fn collapse_slashes(path: &str) -> String {
    let mut collapsed = path.to_string();
    while collapsed.contains("//") {
        collapsed = collapsed.replace("//", "/");
    }
    collapsed
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers.get(CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
}
