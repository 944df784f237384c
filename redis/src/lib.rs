//! Redis status store for deferred request execution.
//!
//! Implements [`StatusStore`] on top of plain Redis commands:
//!
//! - **Record**: `SET {prefix}{task_id} <json> [EX ttl]` / `GET {prefix}{task_id}`
//! - **Transition**: a Lua check-and-set, so the status never moves back from terminal
//! - **Notifications**: `PUBLISH {channel} <json>` / `SUBSCRIBE {channel}`
//!
//! The key prefix defaults to empty, so records are keyed by the bare task id.
//! Records expire after one day unless configured otherwise.
//!
//! # Example
//!
//! ```no_run
//! use deferred_redis::RedisStatusStore;
//! use deferred_core::{StatusStore, TaskId, TaskStatusRecord};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStatusStore::new("redis://127.0.0.1:6379")
//!     .await?
//!     .with_key_prefix("async:")
//!     .with_ttl(Some(Duration::from_secs(3600)));
//!
//! let task_id = TaskId::new();
//! store.set(task_id, &TaskStatusRecord::processing("user:1")).await?;
//! assert!(store.get(task_id).await?.is_some());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use deferred_core::{
    NotificationStream, StatusEvent, StatusStore, StoreError, TaskId, TaskStatusRecord,
};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default lifetime of a status record.
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

/// Conditional write: a processing record never replaces a terminal one and
/// a failed record never replaces a completed one.
///
/// KEYS[1] record key; ARGV[1] record JSON, ARGV[2] incoming status,
/// ARGV[3] TTL in seconds (0 = no expiry). Returns 1 when written.
const ADVANCE_SCRIPT: &str = r"
    local current = redis.call('GET', KEYS[1])
    if current then
        local existing = cjson.decode(current)['status']
        local incoming = ARGV[2]
        if incoming == 'processing' and (existing == 'completed' or existing == 'failed') then
            return 0
        end
        if incoming == 'failed' and existing == 'completed' then
            return 0
        end
    end

    local ttl = tonumber(ARGV[3])
    if ttl > 0 then
        redis.call('SET', KEYS[1], ARGV[1], 'EX', ttl)
    else
        redis.call('SET', KEYS[1], ARGV[1])
    end
    return 1
";

/// Redis-backed status store.
///
/// # Thread Safety
///
/// This type is `Clone` and can be safely shared across threads.
/// Each clone shares the same `ConnectionManager`. Subscriptions open a
/// dedicated pub/sub connection each.
#[derive(Clone)]
pub struct RedisStatusStore {
    /// Client used to open pub/sub connections.
    client: Client,
    /// Connection manager for commands.
    conn_manager: ConnectionManager,
    /// Prepended to every record key.
    key_prefix: String,
    /// Record expiry, `None` to keep records forever.
    ttl: Option<Duration>,
}

impl RedisStatusStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - connection URL, e.g. `redis://[:password@]host[:port][/db]`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionFailed`] if the URL is malformed or the
    /// connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            StoreError::ConnectionFailed(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            StoreError::ConnectionFailed(format!(
                "Failed to create Redis connection manager: {e}"
            ))
        })?;

        tracing::info!("RedisStatusStore initialized successfully");

        Ok(Self {
            client,
            conn_manager,
            key_prefix: String::new(),
            ttl: Some(DEFAULT_TTL),
        })
    }

    /// Namespace record keys.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the record expiry.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Redis key of a task's record.
    #[must_use]
    pub fn record_key(&self, task_id: TaskId) -> String {
        format!("{}{task_id}", self.key_prefix)
    }
}

impl StatusStore for RedisStatusStore {
    fn set(
        &self,
        task_id: TaskId,
        record: &TaskStatusRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let key = self.record_key(task_id);
        let encoded = serde_json::to_string(record);
        let ttl = self.ttl;
        let status = record.status;

        Box::pin(async move {
            let value = encoded?;
            let mut conn = self.conn_manager.clone();

            let result: redis::RedisResult<()> = match ttl {
                Some(ttl) => conn.set_ex(&key, value, ttl.as_secs().max(1)).await,
                None => conn.set(&key, value).await,
            };
            result.map_err(|e| StoreError::OperationFailed(format!("SET {key}: {e}")))?;

            tracing::debug!(task_id = %task_id, status = %status, "Status record stored");
            Ok(())
        })
    }

    fn advance(
        &self,
        task_id: TaskId,
        record: &TaskStatusRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + '_>> {
        let key = self.record_key(task_id);
        let encoded = serde_json::to_string(record);
        let ttl_secs = self.ttl.map_or(0, |ttl| ttl.as_secs().max(1));
        let status = record.status;

        Box::pin(async move {
            let value = encoded?;
            let mut conn = self.conn_manager.clone();

            let written: i64 = redis::Script::new(ADVANCE_SCRIPT)
                .key(&key)
                .arg(value)
                .arg(status.as_str())
                .arg(ttl_secs)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| StoreError::OperationFailed(format!("advance {key}: {e}")))?;

            tracing::debug!(task_id = %task_id, status = %status, written = written == 1, "Status record advanced");
            Ok(written == 1)
        })
    }

    fn get(
        &self,
        task_id: TaskId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TaskStatusRecord>, StoreError>> + Send + '_>>
    {
        let key = self.record_key(task_id);

        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| StoreError::OperationFailed(format!("GET {key}: {e}")))?;

            raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
                .transpose()
        })
    }

    fn publish(
        &self,
        channel: &str,
        event: &StatusEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let channel = channel.to_string();
        let encoded = serde_json::to_string(event);

        Box::pin(async move {
            let message = encoded?;
            let mut conn = self.conn_manager.clone();
            let receivers: i64 =
                conn.publish(&channel, message)
                    .await
                    .map_err(|e| StoreError::PublishFailed {
                        channel: channel.clone(),
                        reason: e.to_string(),
                    })?;

            tracing::trace!(channel = %channel, receivers, "Status event published");
            Ok(())
        })
    }

    fn subscribe(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<NotificationStream, StoreError>> + Send + '_>> {
        let channel = channel.to_string();

        Box::pin(async move {
            let subscription_error = |e: redis::RedisError| StoreError::SubscriptionFailed {
                channel: channel.clone(),
                reason: e.to_string(),
            };

            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(subscription_error)?;
            pubsub.subscribe(&channel).await.map_err(subscription_error)?;

            tracing::debug!(channel = %channel, "Subscribed to status channel");

            let stream = pubsub.into_on_message().map(|msg| {
                let payload: String = msg
                    .get_payload()
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                serde_json::from_str::<StatusEvent>(&payload).map_err(StoreError::from)
            });

            Ok(Box::pin(stream) as NotificationStream)
        })
    }
}
