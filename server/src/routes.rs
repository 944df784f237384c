//! Router configuration for the deferred server.
//!
//! A small demo API sits behind the deferral gate next to the result
//! endpoint and health checks.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use deferred_web::{deferral_layer, handlers, AppError, DeferredState, RequireDeferred, WebResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tower_http::trace::TraceLayer;

/// In-memory shop records keyed by id.
#[derive(Clone, Default)]
pub struct ShopState {
    shops: Arc<RwLock<HashMap<String, Value>>>,
}

/// Query parameters of the demo endpoints.
#[derive(Debug, Deserialize)]
pub struct SomeParams {
    /// Echoed back in the response
    #[serde(default)]
    pub some_str: String,
}

fn sample(params: &SomeParams) -> Json<Value> {
    Json(json!([{
        "some_str": params.some_str,
        "some_int": 1,
        "some_dict": {"some_float": 1.2},
    }]))
}

/// Runs synchronously or deferred, depending on the caller.
async fn some_async_endpoint(Query(params): Query<SomeParams>) -> Json<Value> {
    tracing::info!(some_str = %params.some_str, "some_async_endpoint called");
    sample(&params)
}

/// Plain synchronous endpoint, never listed as async-only.
async fn some_sync_endpoint(Query(params): Query<SomeParams>) -> Json<Value> {
    sample(&params)
}

/// Async-only update: a direct call is refused with 409.
async fn patch_shop(
    _: RequireDeferred,
    State(state): State<ShopState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let attributes = body["data"]["attributes"].clone();
    state
        .shops
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id.clone(), attributes.clone());
    tracing::info!(shop_id = %id, "Shop updated");
    Json(json!({"data": {"id": id, "type": "shop", "attributes": attributes}}))
}

async fn get_shop(State(state): State<ShopState>, Path(id): Path<String>) -> WebResult<Json<Value>> {
    let shops = state.shops.read().unwrap_or_else(PoisonError::into_inner);
    let attributes = shops
        .get(&id)
        .ok_or_else(|| AppError::not_found("Shop", &id))?;
    Ok(Json(json!({"data": {"id": id, "type": "shop", "attributes": attributes}})))
}

async fn delete_shop(State(state): State<ShopState>, Path(id): Path<String>) -> WebResult<StatusCode> {
    state
        .shops
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| AppError::not_found("Shop", &id))
}

/// Build the complete Axum router.
///
/// The same router serves live traffic and replays, so replays pass the gate
/// and the trace layer exactly like the original request did.
pub fn build_router(state: DeferredState) -> Router {
    let api_routes = Router::new()
        .route("/some-async-endpoint/", get(some_async_endpoint))
        .route("/some-sync-endpoint/", get(some_sync_endpoint))
        .route("/shops/:id/", patch(patch_shop).get(get_shop).delete(delete_shop))
        .with_state(ShopState::default());

    Router::new()
        .nest("/api/v1", api_routes)
        .merge(handlers::routes(state.clone()))
        .layer(deferral_layer(state))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use deferred_core::TRIGGER_HEADER;
    use deferred_testing::{InMemoryStatusStore, InMemoryTaskBroker};
    use deferred_web::{BearerChannelResolver, DeferralConfig, StaticTokenVerifier};
    use tower::ServiceExt;

    fn router(broker: Arc<InMemoryTaskBroker>) -> Router {
        let state = DeferredState::new(
            DeferralConfig::default(),
            broker,
            Arc::new(InMemoryStatusStore::new()),
            Arc::new(BearerChannelResolver::new(
                StaticTokenVerifier::new().with_token("token", "alice"),
            )),
        );
        build_router(state)
    }

    fn authed(uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("authorization", "Bearer token")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_sync_call_passes_through() {
        let broker = Arc::new(InMemoryTaskBroker::new());
        let response = router(broker.clone())
            .oneshot(authed("/api/v1/some-sync-endpoint/?some_str=hi").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await[0]["some_str"], "hi");
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_triggered_call_is_deferred() {
        let broker = Arc::new(InMemoryTaskBroker::new());
        let response = router(broker.clone())
            .oneshot(
                authed("/api/v1/some-async-endpoint/?some_str=hi")
                    .header(TRIGGER_HEADER, "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert!(body["meta"]["async_request_id"].is_string());
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_shop_is_not_found() {
        let response = router(Arc::new(InMemoryTaskBroker::new()))
            .oneshot(authed("/api/v1/shops/42/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            json_body(response).await,
            json!({"detail": "Shop with id 42 not found"})
        );
    }
}
