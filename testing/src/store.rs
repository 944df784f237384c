//! In-memory status store.
//!
//! Complements [`InMemoryTaskBroker`](crate::InMemoryTaskBroker): records live
//! in a `HashMap`, channels are tokio broadcast channels, and every write and
//! published event is logged for assertions.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use deferred_core::{
    NotificationStream, StatusEvent, StatusStore, StoreError, TaskId, TaskStatus,
    TaskStatusRecord,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// In-memory status store for fast, deterministic tests.
///
/// # Example
///
/// ```
/// use deferred_testing::InMemoryStatusStore;
/// use deferred_core::{StatusStore, TaskId, TaskStatusRecord};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryStatusStore::new();
/// let task_id = TaskId::new();
///
/// store.set(task_id, &TaskStatusRecord::processing("user:1")).await?;
/// assert!(store.get(task_id).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStatusStore {
    records: Arc<RwLock<HashMap<TaskId, TaskStatusRecord>>>,
    writes: Arc<Mutex<Vec<(TaskId, TaskStatusRecord)>>>,
    events: Arc<Mutex<Vec<(String, StatusEvent)>>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<StatusEvent>>>>,
    fail_publish: Arc<AtomicBool>,
}

impl InMemoryStatusStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `publish` fail (records are still written).
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Current record of a task, without going through the trait.
    #[must_use]
    pub fn record(&self, task_id: TaskId) -> Option<TaskStatusRecord> {
        self.records.read().unwrap().get(&task_id).cloned()
    }

    /// Seed a record directly.
    pub fn insert(&self, task_id: TaskId, record: TaskStatusRecord) {
        self.records.write().unwrap().insert(task_id, record);
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether no record is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Statuses written for a task, in write order.
    #[must_use]
    pub fn history(&self, task_id: TaskId) -> Vec<TaskStatus> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == task_id)
            .map(|(_, record)| record.status)
            .collect()
    }

    /// Every successfully published event with its channel, in order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, StatusEvent)> {
        self.events.lock().unwrap().clone()
    }

    /// Events published for one task.
    #[must_use]
    pub fn events_for(&self, task_id: TaskId) -> Vec<(String, StatusEvent)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event)| event.task_id == task_id)
            .cloned()
            .collect()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<StatusEvent> {
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl StatusStore for InMemoryStatusStore {
    fn set(
        &self,
        task_id: TaskId,
        record: &TaskStatusRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            self.writes.lock().unwrap().push((task_id, record.clone()));
            self.records.write().unwrap().insert(task_id, record);
            Ok(())
        })
    }

    fn advance(
        &self,
        task_id: TaskId,
        record: &TaskStatusRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            // The write lock spans check and insert.
            let mut records = self.records.write().unwrap();
            if records
                .get(&task_id)
                .is_some_and(|existing| !record.may_replace(existing))
            {
                return Ok(false);
            }
            self.writes.lock().unwrap().push((task_id, record.clone()));
            records.insert(task_id, record);
            Ok(true)
        })
    }

    fn get(
        &self,
        task_id: TaskId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TaskStatusRecord>, StoreError>> + Send + '_>>
    {
        Box::pin(async move { Ok(self.record(task_id)) })
    }

    fn publish(
        &self,
        channel: &str,
        event: &StatusEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let channel = channel.to_string();
        let event = event.clone();
        Box::pin(async move {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(StoreError::PublishFailed {
                    channel,
                    reason: "publish disabled".to_string(),
                });
            }
            self.events.lock().unwrap().push((channel.clone(), event.clone()));
            // No subscribers is not an error, as with Redis PUBLISH.
            let _ = self.sender(&channel).send(event);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<NotificationStream, StoreError>> + Send + '_>> {
        let mut rx = self.sender(channel).subscribe();
        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    match rx.recv().await {
                        Ok(event) => yield Ok(event),
                        Err(broadcast::error::RecvError::Lagged(_)) => {},
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as NotificationStream)
        })
    }
}
