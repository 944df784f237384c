//! Builders and polling helpers for tests.

use deferred_core::{
    DeferredRequestPayload, RequestBody, RequestKind, StatusStore, TaskId, TaskStatusRecord,
    INTERNAL_HEADER,
};
use serde_json::Value;
use std::time::Duration;

/// Captured request as the gate would produce it.
///
/// `path_and_query` is split on the first `?`. The marker header is set and
/// a JSON content type is added.
#[must_use]
pub fn payload(method: &str, path_and_query: &str, body: Value) -> DeferredRequestPayload {
    let (path, query) = path_and_query
        .split_once('?')
        .unwrap_or((path_and_query, ""));

    DeferredRequestPayload {
        path: path.to_string(),
        query_string: query.to_string(),
        headers: vec![
            ("content-type".to_string(), "application/json".to_string()),
            (INTERNAL_HEADER.to_string(), "true".to_string()),
        ],
        request_client: None,
        method: method.to_string(),
        kind: RequestKind::Http,
        http_version: "1.1".to_string(),
        scheme: "http".to_string(),
        body: RequestBody::from(body),
    }
}

/// Poll until the task has a terminal record or `timeout` elapses.
pub async fn wait_for_terminal(
    store: &dyn StatusStore,
    task_id: TaskId,
    timeout: Duration,
) -> Option<TaskStatusRecord> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(record)) = store.get(task_id).await {
            if record.status.is_terminal() {
                return Some(record);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until every task is terminal; returns the records in input order.
pub async fn wait_for_all_terminal(
    store: &dyn StatusStore,
    task_ids: &[TaskId],
    timeout: Duration,
) -> Option<Vec<TaskStatusRecord>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut records = Vec::with_capacity(task_ids.len());
    for &task_id in task_ids {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        records.push(wait_for_terminal(store, task_id, remaining).await?);
    }
    Some(records)
}
