//! Redpanda task broker for deferred request execution.
//!
//! This crate provides a Redpanda-based broker that implements the
//! [`TaskBroker`] trait from `deferred-core`. It uses rdkafka for
//! Kafka-compatible streaming, so any Kafka-protocol broker works (Redpanda,
//! Apache Kafka, MSK, Event Hubs).
//!
//! # Partitioning
//!
//! Each envelope is published with its `partition_marker` as the message key.
//! Kafka hashes keys to partitions, so every envelope targeting the same
//! resource lands on the same partition and is consumed in publish order by
//! exactly one member of the consumer group. Envelopes without a marker are
//! published without a key and spread across partitions.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - The offset of a message is committed only after the consumer acknowledged
//!   its [`Delivery`]
//! - The next message is not handed out before the current one is acknowledged
//! - If a delivery is dropped without acknowledgement the subscription stops
//!   without committing, and the group rebalances the partition for redelivery
//!
//! # Example
//!
//! ```no_run
//! use deferred_redpanda::RedpandaTaskBroker;
//! use deferred_core::TaskBroker;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaTaskBroker::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("deferred-consumers")
//!     .build()?;
//!
//! let mut deliveries = broker.subscribe(&["async-request"]).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("Received task {}", delivery.envelope.task_id);
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use deferred_core::{BrokerError, Delivery, DeliveryStream, DispatchEnvelope, TaskBroker};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::oneshot;

/// Redpanda task broker.
///
/// Owns one `FutureProducer` shared by every publish. Each call to
/// [`TaskBroker::subscribe`] creates a new `StreamConsumer` in the configured
/// consumer group, so N subscriptions form a group of N consumers.
///
/// # Example
///
/// ```no_run
/// use deferred_redpanda::RedpandaTaskBroker;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaTaskBroker::new("localhost:9092")?;
///
/// let broker = RedpandaTaskBroker::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .auto_offset_reset("earliest")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaTaskBroker {
    /// Kafka producer for publishing envelopes
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Consumer group ID (if explicitly set)
    consumer_group: Option<String>,
    /// Auto offset reset policy
    auto_offset_reset: String,
}

impl RedpandaTaskBroker {
    /// Create a broker with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the broker.
    #[must_use]
    pub fn builder() -> RedpandaTaskBrokerBuilder {
        RedpandaTaskBrokerBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used by subscriptions.
    #[must_use]
    pub fn consumer_group_for(&self, topics: &[String]) -> String {
        consumer_group_id(self.consumer_group.as_deref(), topics)
    }
}

/// Explicit group, else one derived from the sorted topic names.
fn consumer_group_id(explicit: Option<&str>, topics: &[String]) -> String {
    if let Some(group) = explicit {
        return group.to_string();
    }
    let mut sorted = topics.to_vec();
    sorted.sort();
    format!("deferred-{}", sorted.join("-"))
}

/// Builder for configuring a [`RedpandaTaskBroker`].
#[derive(Default)]
pub struct RedpandaTaskBrokerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
}

impl RedpandaTaskBrokerBuilder {
    /// Set the broker addresses (comma-separated, e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"1"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Bounds how long the deferral gate waits for a publish acknowledgement.
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID for subscriptions.
    ///
    /// All replay workers must share one group so each envelope is replayed
    /// once per group.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the auto offset reset policy for new consumer groups
    /// (`"earliest"`, `"latest"` or `"error"`).
    ///
    /// Default: `"earliest"`, so envelopes published before the first worker
    /// joined are not skipped.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaTaskBroker`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaTaskBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("1");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks = acks,
            compression = compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaTaskBroker created successfully"
        );

        Ok(RedpandaTaskBroker {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            auto_offset_reset,
        })
    }
}

impl TaskBroker for RedpandaTaskBroker {
    fn publish(
        &self,
        topic: &str,
        envelope: &DispatchEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let topic = topic.to_string();
        let envelope = envelope.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let payload = envelope.to_json().map_err(|e| BrokerError::PublishFailed {
                topic: topic.clone(),
                reason: format!("Failed to serialize envelope: {e}"),
            })?;

            let mut record: FutureRecord<'_, str, [u8]> =
                FutureRecord::to(&topic).payload(payload.as_slice());
            if let Some(key) = envelope.partition_marker.as_deref() {
                record = record.key(key);
            }

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        task_id = %envelope.task_id,
                        partition_marker = ?envelope.partition_marker,
                        "Envelope published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        task_id = %envelope.task_id,
                        error = %kafka_error,
                        "Failed to publish envelope"
                    );
                    Err(BrokerError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    #[allow(clippy::too_many_lines)] // Manual commits gated on acknowledgement
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let group_id = self.consumer_group_for(&topics);
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BrokerError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BrokerError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %group_id,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Subscribed to topics"
            );

            // One in flight at a time: the forwarder waits for the ack before
            // pulling the next message.
            let (tx, rx) = tokio::sync::mpsc::channel(1);

            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    let message = match msg_result {
                        Ok(message) => message,
                        Err(e) => {
                            let err =
                                BrokerError::TransportError(format!("Failed to receive message: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                            continue;
                        },
                    };

                    let decoded = match message.payload() {
                        Some(payload) => DispatchEnvelope::from_json(payload).map_err(|e| {
                            BrokerError::DeserializationFailed(format!(
                                "Failed to deserialize envelope: {e}"
                            ))
                        }),
                        None => Err(BrokerError::DeserializationFailed(
                            "Message has no payload".to_string(),
                        )),
                    };

                    match decoded {
                        Ok(envelope) => {
                            tracing::trace!(
                                topic = message.topic(),
                                partition = message.partition(),
                                offset = message.offset(),
                                task_id = %envelope.task_id,
                                "Received envelope"
                            );

                            let (ack_tx, ack_rx) = oneshot::channel();
                            if tx.send(Ok(Delivery::new(envelope, ack_tx))).await.is_err() {
                                tracing::debug!("Delivery receiver dropped, exiting consumer task");
                                break;
                            }
                            if ack_rx.await.is_err() {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    "Delivery dropped without ack, leaving offset uncommitted"
                                );
                                break;
                            }
                        },
                        Err(err) => {
                            // Poison message: report it, then commit past it.
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        },
                    }

                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        tracing::warn!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            "Failed to commit offset (message may be redelivered)"
                        );
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
