//! Publishing captured requests.

use deferred_core::{BrokerError, DeferredRequestPayload, DispatchEnvelope, TaskBroker, TaskId};
use std::sync::Arc;
use thiserror::Error;

/// Failure to hand a captured request to the broker.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The broker did not acknowledge the publish.
    #[error("Failed to publish task {task_id} to {topic}: {source}")]
    Publish {
        /// Task id that was generated for the request
        task_id: TaskId,
        /// Target topic
        topic: String,
        /// Broker failure
        #[source]
        source: BrokerError,
    },
}

/// Wraps payloads in envelopes and publishes them.
#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn TaskBroker>,
}

impl Dispatcher {
    /// Create a dispatcher over `broker`.
    #[must_use]
    pub fn new(broker: Arc<dyn TaskBroker>) -> Self {
        Self { broker }
    }

    /// Publish `payload` and return its task id.
    ///
    /// Returns only after the broker acknowledged the publish. Envelopes with
    /// the same `partition_marker` keep their publish order.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Publish`] if the broker rejects the message.
    pub async fn enqueue(
        &self,
        topic: &str,
        channel_name: &str,
        payload: DeferredRequestPayload,
        partition_marker: Option<String>,
    ) -> Result<TaskId, DispatchError> {
        let envelope = DispatchEnvelope::new(channel_name, payload, partition_marker);
        let task_id = envelope.task_id;

        match self.broker.publish(topic, &envelope).await {
            Ok(()) => {
                metrics::counter!("deferred.dispatch.published").increment(1);
                tracing::info!(
                    task_id = %task_id,
                    topic = topic,
                    channel = channel_name,
                    partition_marker = ?envelope.partition_marker,
                    method = %envelope.payload.method,
                    path = %envelope.payload.path,
                    "Deferred request enqueued"
                );
                Ok(task_id)
            },
            Err(source) => {
                metrics::counter!("deferred.dispatch.failed").increment(1);
                Err(DispatchError::Publish {
                    task_id,
                    topic: topic.to_string(),
                    source,
                })
            },
        }
    }
}
