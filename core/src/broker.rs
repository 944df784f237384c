//! Broker abstraction for deferred request dispatch.
//!
//! The gate publishes [`DispatchEnvelope`]s to a topic; consumer workers
//! subscribe and replay them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    publish(topic, envelope)    ┌──────────┐
//! │ Deferral Gate│ ─────────────────────────────► │  Broker  │
//! └──────────────┘      keyed by partition_marker └────┬─────┘
//!                                                      │ Delivery
//!                                           ┌──────────┼──────────┐
//!                                           ▼          ▼          ▼
//!                                      ┌────────┐ ┌────────┐ ┌────────┐
//!                                      │consumer│ │consumer│ │consumer│
//!                                      └────────┘ └────────┘ └────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: an envelope may be delivered more than once
//! - **Ordered within partition**: envelopes sharing a `partition_marker` land
//!   on one partition and are handed out one at a time in publish order
//! - **Explicit acknowledgement**: the next envelope of a partition is not
//!   handed out until the current [`Delivery`] is acknowledged or dropped
//!
//! # Implementations
//!
//! - `InMemoryTaskBroker` in `deferred-testing`
//! - `RedpandaTaskBroker` in `deferred-redpanda`

use crate::envelope::DispatchEnvelope;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an envelope to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize an envelope
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Generic error for other failures
    #[error("Broker error: {0}")]
    Other(String),
}

/// One envelope handed to a consumer.
///
/// Holding a `Delivery` leases its partition. Call [`Delivery::ack`] once the
/// envelope is fully handled; dropping it without acking releases the lease
/// but the broker treats the envelope as unprocessed.
#[derive(Debug)]
pub struct Delivery {
    /// The delivered envelope.
    pub envelope: DispatchEnvelope,
    ack: oneshot::Sender<()>,
}

impl Delivery {
    /// Wrap an envelope with its acknowledgement handle.
    #[must_use]
    pub const fn new(envelope: DispatchEnvelope, ack: oneshot::Sender<()>) -> Self {
        Self { envelope, ack }
    }

    /// Mark the envelope as handled.
    pub fn ack(self) {
        // Receiver gone means the broker stopped; nothing left to commit.
        let _ = self.ack.send(());
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Publish/subscribe transport for dispatch envelopes.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the broker can be shared
/// as `Arc<dyn TaskBroker>` between the gate and the consumer pool.
pub trait TaskBroker: Send + Sync {
    /// Publish an envelope to a topic.
    ///
    /// Keyed by `envelope.partition_marker` when present. Resolves once the
    /// broker acknowledged the write; never waits for consumption.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker rejected the write.
    fn publish(
        &self,
        topic: &str,
        envelope: &DispatchEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Subscribe to one or more topics as a member of the broker's consumer
    /// group.
    ///
    /// Each subscription is one consumer: partitions are shared across all
    /// live subscriptions of the group.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>>;
}
