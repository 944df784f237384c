//! Shared harness: a small shop API behind the deferral gate, wired to the
//! in-memory broker and status store.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, Request, StatusCode},
    routing::get,
    Json, Router,
};
use deferred_core::{DispatchEnvelope, TaskBroker, TaskId, INTERNAL_HEADER, TRIGGER_HEADER};
use deferred_runtime::{spawn_consumer_pool, ConsumerPoolConfig, EnvelopeHandler, RetryPolicy};
use deferred_testing::{InMemoryStatusStore, InMemoryTaskBroker};
use deferred_web::{
    deferral_layer, handlers, BearerChannelResolver, DeferralConfig, DeferredAccepted,
    DeferredState, ReplayExecutor, RequireDeferred, StaticTokenVerifier, StatusNotifier,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tower::ServiceExt;

pub const TOPIC: &str = "async-request";
pub const ALICE: &str = "alice-token";
pub const BOB: &str = "bob-token";

#[derive(Clone, Default)]
pub struct Shop {
    pub calls: Arc<AtomicUsize>,
    pub shops: Arc<Mutex<HashMap<String, Value>>>,
}

async fn some_async_endpoint(
    State(shop): State<Shop>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    shop.calls.fetch_add(1, Ordering::SeqCst);
    let some_str = params.get("some_str").cloned().unwrap_or_default();
    Json(json!([{"some_str": some_str, "some_int": 1, "some_dict": {"some_float": 1.2}}]))
}

async fn patch_shop(
    _: RequireDeferred,
    State(shop): State<Shop>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    shop.calls.fetch_add(1, Ordering::SeqCst);
    let attributes = body["data"]["attributes"].clone();
    shop.shops.lock().unwrap().insert(id.clone(), attributes.clone());
    Json(json!({"data": {"id": id, "attributes": attributes}}))
}

async fn get_shop(State(shop): State<Shop>, Path(id): Path<String>) -> (StatusCode, Json<Value>) {
    shop.calls.fetch_add(1, Ordering::SeqCst);
    match shop.shops.lock().unwrap().get(&id) {
        Some(attributes) => (
            StatusCode::OK,
            Json(json!({"data": {"id": id, "attributes": attributes}})),
        ),
        None => (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found."}))),
    }
}

async fn delete_shop(State(shop): State<Shop>, Path(id): Path<String>) -> StatusCode {
    shop.calls.fetch_add(1, Ordering::SeqCst);
    if shop.shops.lock().unwrap().remove(&id).is_some() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn file_name(headers: HeaderMap) -> Json<Value> {
    let name = headers
        .get("x-file-name")
        .and_then(|value| std::str::from_utf8(value.as_bytes()).ok())
        .unwrap_or_default();
    Json(json!({"file_name": name}))
}

pub struct Harness {
    pub broker: Arc<InMemoryTaskBroker>,
    pub store: Arc<InMemoryStatusStore>,
    pub shop: Shop,
    pub app: Router,
}

impl Harness {
    pub fn new(config: DeferralConfig) -> Self {
        Self::with_broker(config, Arc::new(InMemoryTaskBroker::new()))
    }

    pub fn with_broker(config: DeferralConfig, broker: Arc<InMemoryTaskBroker>) -> Self {
        let store = Arc::new(InMemoryStatusStore::new());
        let (router, shop) = app(config, broker.clone(), store.clone());
        Self {
            broker,
            store,
            shop,
            app: router,
        }
    }

    pub fn executor(&self) -> ReplayExecutor {
        ReplayExecutor::new(self.app.clone(), StatusNotifier::new(self.store.clone()))
    }

    pub fn calls(&self) -> usize {
        self.shop.calls.load(Ordering::SeqCst)
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        send(&self.app, request).await
    }

    /// Send a triggered request and return the task id from the 202.
    pub async fn defer(&self, request: Request<Body>) -> TaskId {
        let (status, body) = self.send(request).await;
        assert_eq!(status, StatusCode::ACCEPTED, "unexpected body: {body}");
        let accepted: DeferredAccepted = serde_json::from_value(body).unwrap();
        accepted.meta.async_request_id
    }

    pub fn envelope(&self, task_id: TaskId) -> DispatchEnvelope {
        self.broker
            .published_to(TOPIC)
            .into_iter()
            .find(|envelope| envelope.task_id == task_id)
            .expect("task was not published")
    }

    /// Start `count` consumers replaying through this harness' app.
    pub fn consumers(&self, count: usize) -> (broadcast::Sender<()>, Vec<tokio::task::JoinHandle<()>>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut config = ConsumerPoolConfig::new("replay", vec![TOPIC.to_string()]);
        config.retry_policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        config.reconnect_delay = Duration::from_millis(10);

        let broker: Arc<dyn TaskBroker> = self.broker.clone();
        let handler: Arc<dyn EnvelopeHandler> = Arc::new(self.executor());
        let handles = spawn_consumer_pool(count, &config, &broker, &handler, &shutdown_tx);
        (shutdown_tx, handles)
    }
}

pub fn app(
    config: DeferralConfig,
    broker: Arc<dyn TaskBroker>,
    store: Arc<InMemoryStatusStore>,
) -> (Router, Shop) {
    let verifier = StaticTokenVerifier::new()
        .with_token(ALICE, "alice")
        .with_token(BOB, "bob");
    let state = DeferredState::new(
        config,
        broker,
        store,
        Arc::new(BearerChannelResolver::new(verifier)),
    );

    let shop = Shop::default();
    let api = Router::new()
        .route("/api/v1/some-async-endpoint/", get(some_async_endpoint))
        .route("/api/v1/files/", get(file_name))
        .route(
            "/api/v1/shops/:id/",
            get(get_shop).patch(patch_shop).delete(delete_shop),
        )
        .with_state(shop.clone());

    let router = api
        .merge(handlers::routes(state.clone()))
        .layer(deferral_layer(state));
    (router, shop)
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

pub fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn triggered(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut request = request(method, uri, token, body);
    request
        .headers_mut()
        .insert(TRIGGER_HEADER, "1".parse().unwrap());
    request
}

pub fn internal(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut request = request(method, uri, token, body);
    request
        .headers_mut()
        .insert(INTERNAL_HEADER, "true".parse().unwrap());
    request
}

pub fn result_uri(task_id: impl std::fmt::Display) -> String {
    format!("/api/v1/async_background_response/{task_id}/")
}

pub fn shop_patch(id: usize, seq: usize) -> Value {
    json!({"data": {"id": id.to_string(), "type": "shop", "attributes": {"name": format!("shop-{id}"), "seq": seq}}})
}
