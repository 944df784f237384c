//! Status persistence and channel notifications.
//!
//! Every transition of a task is written to the [`StatusStore`] first and then
//! announced on the owner's channel as a [`StatusEvent`]. The record is the
//! source of truth; a lost notification only delays the caller until it
//! polls the result endpoint.
//!
//! Writes are guarded so that redelivered or late envelopes cannot move a
//! task backwards (see [`TaskStatusRecord::may_replace`]).

use deferred_core::{
    ReplayOutcome, StatusEvent, StatusStore, StoreError, TaskId, TaskStatus, TaskStatusRecord,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Writes status records and publishes their events.
#[derive(Clone)]
pub struct StatusNotifier {
    store: Arc<dyn StatusStore>,
}

impl StatusNotifier {
    /// Create a notifier over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// Record `status` for a task and notify its channel.
    ///
    /// Returns `false` when the write was skipped because it would replace a
    /// more final record; nothing is published in that case.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record cannot be read or written.
    /// Publish failures are logged only.
    pub async fn set_and_publish(
        &self,
        task_id: TaskId,
        channel_name: &str,
        status: TaskStatus,
        response: Option<Value>,
    ) -> Result<bool, StoreError> {
        let record = TaskStatusRecord::new(status, Some(channel_name.to_string()), response);
        self.apply(task_id, channel_name, record).await
    }

    /// Mark a task as being processed.
    ///
    /// # Errors
    ///
    /// See [`StatusNotifier::set_and_publish`].
    pub async fn processing(&self, task_id: TaskId, channel_name: &str) -> Result<bool, StoreError> {
        self.apply(task_id, channel_name, TaskStatusRecord::processing(channel_name))
            .await
    }

    /// Store a successful replay.
    ///
    /// # Errors
    ///
    /// See [`StatusNotifier::set_and_publish`].
    pub async fn completed(
        &self,
        task_id: TaskId,
        channel_name: &str,
        outcome: &ReplayOutcome,
    ) -> Result<bool, StoreError> {
        self.apply(task_id, channel_name, TaskStatusRecord::completed(channel_name, outcome))
            .await
    }

    /// Store a failed replay as `{"error": message}`.
    ///
    /// # Errors
    ///
    /// See [`StatusNotifier::set_and_publish`].
    pub async fn failed(
        &self,
        task_id: TaskId,
        channel_name: &str,
        error: impl fmt::Display + Send,
    ) -> Result<bool, StoreError> {
        self.apply(task_id, channel_name, TaskStatusRecord::failed(channel_name, error))
            .await
    }

    async fn apply(
        &self,
        task_id: TaskId,
        channel_name: &str,
        record: TaskStatusRecord,
    ) -> Result<bool, StoreError> {
        let status = record.status;
        if !self.store.advance(task_id, &record).await? {
            tracing::debug!(
                task_id = %task_id,
                rejected = %status,
                "Keeping more final task status"
            );
            return Ok(false);
        }

        let event = StatusEvent::new(task_id, status);
        if let Err(e) = self.store.publish(channel_name, &event).await {
            metrics::counter!("deferred.notify.publish_failed").increment(1);
            tracing::warn!(
                task_id = %task_id,
                channel = channel_name,
                status = %status,
                error = %e,
                "Failed to publish task status event"
            );
        }

        tracing::debug!(task_id = %task_id, status = %status, channel = channel_name, "Task status updated");
        Ok(true)
    }
}
