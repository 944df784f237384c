//! Status store abstraction.
//!
//! Holds one current [`TaskStatusRecord`] per task and fans out
//! [`StatusEvent`]s on named channels. Implementations:
//!
//! - `RedisStatusStore` in `deferred-redis` (SET/GET plus PUBLISH/SUBSCRIBE)
//! - `InMemoryStatusStore` in `deferred-testing`

use crate::envelope::TaskId;
use crate::status::{StatusEvent, TaskStatusRecord};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during status store operations.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Failed to connect to the store
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A read or write failed
    #[error("Store operation failed: {0}")]
    OperationFailed(String),

    /// Stored data could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Publishing to a channel failed
    #[error("Publish failed on channel '{channel}': {reason}")]
    PublishFailed {
        /// Channel name
        channel: String,
        /// The reason for failure
        reason: String,
    },

    /// Subscribing to a channel failed
    #[error("Subscription failed on channel '{channel}': {reason}")]
    SubscriptionFailed {
        /// Channel name
        channel: String,
        /// The reason for failure
        reason: String,
    },
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Stream of status notifications from one channel.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Result<StatusEvent, StoreError>> + Send>>;

/// Key-value store for task status plus channel pub/sub.
pub trait StatusStore: Send + Sync {
    /// Write the current record for a task, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn set(
        &self,
        task_id: TaskId,
        record: &TaskStatusRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Write `record` unless the stored one is more final.
    ///
    /// Check and write are one atomic step, judged by
    /// [`TaskStatusRecord::may_replace`], so concurrent deliveries of the
    /// same envelope cannot move a terminal record back. Returns whether the
    /// record was written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read or write fails.
    fn advance(
        &self,
        task_id: TaskId,
        record: &TaskStatusRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + '_>>;

    /// Read the current record for a task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or the stored value is corrupt.
    fn get(
        &self,
        task_id: TaskId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TaskStatusRecord>, StoreError>> + Send + '_>>;

    /// Publish a notification on a channel.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::PublishFailed`] if the publish fails.
    fn publish(
        &self,
        channel: &str,
        event: &StatusEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Subscribe to notifications on a channel.
    ///
    /// Only events published after the subscription is established are seen.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SubscriptionFailed`] if the subscription fails.
    fn subscribe(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<NotificationStream, StoreError>> + Send + '_>>;
}
