//! End-to-end deferred execution: gate → broker → consumer pool → status → result.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use axum::http::{HeaderValue, StatusCode};
use common::{internal, request, result_uri, shop_patch, triggered, Harness, ALICE, BOB};
use deferred_core::{TaskStatus, TaskStatusRecord, STATUS_EVENT_ACTION};
use deferred_runtime::await_shutdown;
use deferred_testing::{wait_for_all_terminal, wait_for_terminal};
use deferred_web::DeferralConfig;
use serde_json::json;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_deferred_get_end_to_end() {
    let harness = Harness::new(DeferralConfig::default());
    let (shutdown_tx, handles) = harness.consumers(2);

    let task_id = harness
        .defer(triggered(
            "GET",
            "/api/v1/some-async-endpoint/?some_str=asdf",
            Some(ALICE),
            None,
        ))
        .await;

    let record = wait_for_terminal(&*harness.store, task_id, WAIT).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(harness.calls(), 1);

    let (status, body) = harness.send(request("GET", &result_uri(task_id), Some(ALICE), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task_id"], task_id.to_string());
    assert_eq!(body["endpoint"], "/api/v1/some-async-endpoint/");
    assert_eq!(body["status"], 200);
    assert_eq!(
        body["response"],
        json!([{"some_str": "asdf", "some_int": 1, "some_dict": {"some_float": 1.2}}])
    );

    let events = harness.store.events_for(task_id);
    let statuses: Vec<_> = events.iter().map(|(_, event)| event.status).collect();
    assert_eq!(statuses, vec![TaskStatus::Processing, TaskStatus::Completed]);
    assert!(events
        .iter()
        .all(|(channel, event)| channel == "user:alice" && event.action == STATUS_EVENT_ACTION));

    shutdown_tx.send(()).unwrap();
    await_shutdown(handles, Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_result_is_private_to_owner() {
    let harness = Harness::new(DeferralConfig::default());
    let task_id = harness
        .defer(triggered("GET", "/api/v1/some-async-endpoint/?some_str=x", Some(ALICE), None))
        .await;
    harness.executor().execute(&harness.envelope(task_id)).await.unwrap();

    let (status, body) = harness.send(request("GET", &result_uri(task_id), Some(BOB), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"detail": "Permission denied: check access"}));

    let (status, _) = harness.send(request("GET", &result_uri(task_id), None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_result_endpoint_reports_each_state() {
    let harness = Harness::new(DeferralConfig::default());
    let processing = deferred_core::TaskId::new();
    let failed = deferred_core::TaskId::new();
    harness
        .store
        .insert(processing, TaskStatusRecord::processing("user:alice"));
    harness
        .store
        .insert(failed, TaskStatusRecord::failed("user:alice", "Handler panicked: boom"));

    let (status, body) = harness.send(request("GET", &result_uri(processing), Some(ALICE), None)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"status": "processing"}));

    let (status, body) = harness.send(request("GET", &result_uri(failed), Some(ALICE), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "failed", "error": "Handler panicked: boom"}));

    let (status, _) = harness.send(request("GET", &result_uri("not-a-uuid"), Some(ALICE), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Ownership is checked before state.
    let (status, _) = harness.send(request("GET", &result_uri(processing), Some(BOB), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_patches_to_same_resource_apply_in_order() {
    const RESOURCES: usize = 15;
    const PATCHES: usize = 10;

    let harness = Harness::new(DeferralConfig::default());
    let (shutdown_tx, handles) = harness.consumers(10);

    let mut task_ids = Vec::with_capacity(RESOURCES * PATCHES);
    for seq in 0..PATCHES {
        for id in 0..RESOURCES {
            let uri = format!("/api/v1/shops/{id}/");
            task_ids.push(
                harness
                    .defer(triggered("PATCH", &uri, Some(ALICE), Some(shop_patch(id, seq))))
                    .await,
            );
        }
    }

    let records = wait_for_all_terminal(&*harness.store, &task_ids, Duration::from_secs(30))
        .await
        .expect("not every task finished");
    assert!(records.iter().all(|r| r.status == TaskStatus::Completed));

    let shops = harness.shop.shops.lock().unwrap().clone();
    assert_eq!(shops.len(), RESOURCES);
    for id in 0..RESOURCES {
        assert_eq!(shops[&id.to_string()]["seq"], PATCHES - 1, "shop {id} out of order");
    }

    shutdown_tx.send(()).unwrap();
    await_shutdown(handles, Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_redelivery_keeps_terminal_content() {
    let harness = Harness::new(DeferralConfig::default());
    let task_id = harness
        .defer(triggered("PATCH", "/api/v1/shops/3/", Some(ALICE), Some(shop_patch(3, 1))))
        .await;
    let envelope = harness.envelope(task_id);
    let executor = harness.executor();

    executor.execute(&envelope).await.unwrap();
    let first = harness.store.record(task_id).unwrap();
    executor.execute(&envelope).await.unwrap();
    let second = harness.store.record(task_id).unwrap();

    assert!(first.same_content(&second));
    assert_eq!(second.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_replay_matches_synchronous_response() {
    let harness = Harness::new(DeferralConfig::default());
    let executor = harness.executor();

    // PATCH with a JSON body: the async-only route runs with the marker.
    let body = shop_patch(5, 2);
    let (sync_status, sync_body) = harness
        .send(internal("PATCH", "/api/v1/shops/5/", Some(ALICE), Some(body.clone())))
        .await;
    let task_id = harness
        .defer(triggered("PATCH", "/api/v1/shops/5/", Some(ALICE), Some(body)))
        .await;
    let outcome = executor.execute(&harness.envelope(task_id)).await.unwrap();
    assert_eq!(outcome.status, sync_status.as_u16());
    assert_eq!(outcome.response, sync_body);

    // GET with a query string and no body.
    let uri = "/api/v1/shops/5/?fields=name";
    let (sync_status, sync_body) = harness.send(request("GET", uri, Some(ALICE), None)).await;
    let task_id = harness.defer(triggered("GET", uri, Some(ALICE), None)).await;
    let envelope = harness.envelope(task_id);
    assert!(envelope.payload.body.is_empty());
    assert_eq!(envelope.payload.query_string, "fields=name");
    let outcome = executor.execute(&envelope).await.unwrap();
    assert_eq!(outcome.status, sync_status.as_u16());
    assert_eq!(outcome.response, sync_body);

    // DELETE with an empty body and an empty response.
    let task_id = harness
        .defer(triggered("DELETE", "/api/v1/shops/5/", Some(ALICE), None))
        .await;
    let outcome = executor.execute(&harness.envelope(task_id)).await.unwrap();
    assert_eq!(outcome.status, 204);
    assert_eq!(outcome.response, json!(""));
    assert!(harness.shop.shops.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_replay_keeps_utf8_header_value() {
    let harness = Harness::new(DeferralConfig::default());
    let mut deferred = triggered("GET", "/api/v1/files/", Some(ALICE), None);
    deferred.headers_mut().insert(
        "x-file-name",
        HeaderValue::from_bytes("résumé.pdf".as_bytes()).unwrap(),
    );
    let task_id = harness.defer(deferred).await;

    harness.executor().execute(&harness.envelope(task_id)).await.unwrap();

    let (status, body) = harness.send(request("GET", &result_uri(task_id), Some(ALICE), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], json!({"file_name": "résumé.pdf"}));
}
