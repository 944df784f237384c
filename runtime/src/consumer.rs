//! Task consumer with automatic reconnection and in-process redelivery.
//!
//! `TaskConsumer` handles the boilerplate of subscribing to the broker,
//! handing each envelope to an [`EnvelopeHandler`], redelivering failures,
//! acknowledging deliveries, reconnecting when the stream ends and
//! coordinating graceful shutdown.
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! ```text
//! loop {
//!     subscribe:
//!         loop {
//!             next delivery:
//!                 - handle envelope
//!                 - on error: back off and redeliver until the policy gives up
//!                 - ack (the broker may now hand out the next envelope)
//!                 - check shutdown signal
//!         }
//!         if stream ended:
//!             wait and resubscribe
//! }
//! ```
//!
//! Deliveries are handled one at a time. An envelope that is being handled
//! when shutdown is signalled is finished and acknowledged first.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = TaskConsumer::builder()
//!     .name("replay-0")
//!     .topics(vec!["async-request".to_string()])
//!     .broker(broker)
//!     .handler(executor)
//!     .shutdown(shutdown_tx.subscribe())
//!     .build()?;
//!
//! let handle = consumer.spawn();
//! ```

use crate::handler::EnvelopeHandler;
use crate::retry::RetryPolicy;
use deferred_core::{BrokerError, Delivery, TaskBroker};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Errors raised while assembling a consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// A required builder field was not set.
    #[error("Consumer builder is missing `{0}`")]
    MissingField(&'static str),
}

/// Broker consumer driving an [`EnvelopeHandler`].
///
/// # Configuration
///
/// - `name`: consumer name (for logging)
/// - `topics`: broker topics to subscribe to
/// - `broker`: broker instance to consume from
/// - `handler`: handler that processes each envelope
/// - `shutdown`: broadcast receiver for graceful shutdown coordination
/// - `retry_policy`: redelivery policy for failed envelopes
/// - `reconnect_delay`: wait before resubscribing (default: 5s)
pub struct TaskConsumer {
    name: String,
    topics: Vec<String>,
    broker: Arc<dyn TaskBroker>,
    handler: Arc<dyn EnvelopeHandler>,
    shutdown: broadcast::Receiver<()>,
    retry_policy: RetryPolicy,
    reconnect_delay: Duration,
}

impl TaskConsumer {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> TaskConsumerBuilder {
        TaskConsumerBuilder::default()
    }

    /// Consumer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the consumer as a background task.
    ///
    /// The task runs until a shutdown signal is received or the shutdown
    /// sender is dropped.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, "Task consumer started");

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Task consumer received shutdown signal");
                    break;
                }
                subscribe_result = self.broker.subscribe(&topics) => {
                    match subscribe_result {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, topics = ?self.topics, "Subscribed to broker");

                            if self.process_stream(&mut stream).await == StreamEnd::Shutdown {
                                break;
                            }

                            warn!(
                                consumer = %self.name,
                                "Delivery stream ended, reconnecting in {:?}",
                                self.reconnect_delay
                            );
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe to broker, retrying in {:?}",
                                self.reconnect_delay
                            );
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Task consumer received shutdown signal");
                    break;
                }
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!(consumer = %self.name, "Task consumer stopped");
    }

    async fn process_stream<S>(&mut self, stream: &mut S) -> StreamEnd
    where
        S: Stream<Item = Result<Delivery, BrokerError>> + Unpin + Send,
    {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Task consumer received shutdown signal during processing");
                    return StreamEnd::Shutdown;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(delivery)) => self.process_delivery(delivery).await,
                        Some(Err(e)) => {
                            metrics::counter!("deferred.consumer.stream_errors").increment(1);
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Error receiving delivery from stream"
                            );
                        }
                        None => return StreamEnd::Closed,
                    }
                }
            }
        }
    }

    /// Handle one delivery, redelivering on failure, then ack it.
    async fn process_delivery(&self, delivery: Delivery) {
        let task_id = delivery.envelope.task_id;
        metrics::counter!("deferred.consumer.deliveries").increment(1);

        let mut attempts = 0;
        loop {
            attempts += 1;
            let Err(e) = self.handler.handle(&delivery.envelope).await else {
                break;
            };

            if !e.is_retryable() || !self.retry_policy.should_retry(attempts) {
                metrics::counter!("deferred.consumer.exhausted").increment(1);
                error!(
                    consumer = %self.name,
                    task_id = %task_id,
                    attempts,
                    error = %e,
                    "Giving up on envelope"
                );
                break;
            }

            let delay = self.retry_policy.delay_for_attempt(attempts - 1);
            metrics::counter!("deferred.consumer.redeliveries").increment(1);
            warn!(
                consumer = %self.name,
                task_id = %task_id,
                attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %e,
                "Envelope failed, redelivering"
            );
            tokio::time::sleep(delay).await;
        }

        delivery.ack();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Closed,
    Shutdown,
}

/// Builder for configuring a [`TaskConsumer`].
#[derive(Default)]
pub struct TaskConsumerBuilder {
    name: Option<String>,
    topics: Option<Vec<String>>,
    broker: Option<Arc<dyn TaskBroker>>,
    handler: Option<Arc<dyn EnvelopeHandler>>,
    shutdown: Option<broadcast::Receiver<()>>,
    retry_policy: Option<RetryPolicy>,
    reconnect_delay: Option<Duration>,
}

impl TaskConsumerBuilder {
    /// Set consumer name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set topics to subscribe to.
    #[must_use]
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// Set broker instance.
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn TaskBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set envelope handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn EnvelopeHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set shutdown signal receiver.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Set redelivery policy (default: [`RetryPolicy::default`]).
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set delay before resubscribing (default: 5 seconds).
    #[must_use]
    pub const fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// Build the [`TaskConsumer`].
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::MissingField`] if name, topics, broker,
    /// handler or shutdown is not set.
    pub fn build(self) -> Result<TaskConsumer, ConsumerError> {
        Ok(TaskConsumer {
            name: self.name.ok_or(ConsumerError::MissingField("name"))?,
            topics: self.topics.ok_or(ConsumerError::MissingField("topics"))?,
            broker: self.broker.ok_or(ConsumerError::MissingField("broker"))?,
            handler: self.handler.ok_or(ConsumerError::MissingField("handler"))?,
            shutdown: self.shutdown.ok_or(ConsumerError::MissingField("shutdown"))?,
            retry_policy: self.retry_policy.unwrap_or_default(),
            reconnect_delay: self.reconnect_delay.unwrap_or(Duration::from_secs(5)),
        })
    }
}

/// Shared settings for a pool of consumers in one consumer group.
#[derive(Clone)]
pub struct ConsumerPoolConfig {
    /// Name prefix; consumers are named `{name}-{index}`.
    pub name: String,
    /// Topics every consumer subscribes to.
    pub topics: Vec<String>,
    /// Redelivery policy.
    pub retry_policy: RetryPolicy,
    /// Delay before resubscribing.
    pub reconnect_delay: Duration,
}

impl ConsumerPoolConfig {
    /// Pool config with default retry policy and reconnect delay.
    #[must_use]
    pub fn new(name: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            name: name.into(),
            topics,
            retry_policy: RetryPolicy::default(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Spawn `count` consumers sharing one broker, handler and shutdown signal.
///
/// Each consumer is an independent subscription, so the broker spreads
/// partitions across them.
#[must_use]
pub fn spawn_consumer_pool(
    count: usize,
    config: &ConsumerPoolConfig,
    broker: &Arc<dyn TaskBroker>,
    handler: &Arc<dyn EnvelopeHandler>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    info!(consumer_count = count, topics = ?config.topics, "Starting consumer pool");

    (0..count)
        .map(|index| {
            TaskConsumer {
                name: format!("{}-{index}", config.name),
                topics: config.topics.clone(),
                broker: Arc::clone(broker),
                handler: Arc::clone(handler),
                shutdown: shutdown.subscribe(),
                retry_policy: config.retry_policy.clone(),
                reconnect_delay: config.reconnect_delay,
            }
            .spawn()
        })
        .collect()
}

/// Wait for consumers to stop, giving each `timeout` to finish its current
/// envelope.
pub async fn await_shutdown(handles: Vec<JoinHandle<()>>, timeout: Duration) {
    for (idx, handle) in handles.into_iter().enumerate() {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => info!(consumer = idx, "Consumer stopped gracefully"),
            Ok(Err(e)) => warn!(consumer = idx, error = %e, "Consumer task failed"),
            Err(_) => warn!(consumer = idx, "Consumer shutdown timed out"),
        }
    }
}
