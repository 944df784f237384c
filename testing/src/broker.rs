//! In-memory task brokers.
//!
//! [`InMemoryTaskBroker`] models a partitioned log with one consumer group:
//!
//! - every topic has a fixed number of partitions
//! - keyed envelopes hash to a partition, keyless ones go round-robin
//! - a partition is leased to one subscriber from hand-out until the
//!   [`Delivery`] is acknowledged, so a key's envelopes are consumed strictly
//!   in publish order whatever the number of subscribers
//! - a delivery dropped without acknowledgement goes back to the head of its
//!   partition and is handed out again

#![allow(clippy::unwrap_used)] // Poisoned test locks are a test failure anyway
#![allow(clippy::missing_panics_doc)]

use deferred_core::{BrokerError, Delivery, DeliveryStream, DispatchEnvelope, TaskBroker};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: usize = 8;

#[derive(Default)]
struct Partition {
    queue: Mutex<VecDeque<DispatchEnvelope>>,
    lease: Arc<tokio::sync::Mutex<()>>,
}

struct Topic {
    partitions: Vec<Arc<Partition>>,
    round_robin: AtomicUsize,
}

impl Topic {
    fn new(count: usize) -> Self {
        Self {
            partitions: (0..count).map(|_| Arc::new(Partition::default())).collect(),
            round_robin: AtomicUsize::new(0),
        }
    }

    fn partition_for(&self, key: Option<&str>) -> usize {
        let count = self.partitions.len();
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                #[allow(clippy::cast_possible_truncation)]
                let slot = (hasher.finish() % count as u64) as usize;
                slot
            },
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        }
    }
}

struct Inner {
    partitions_per_topic: usize,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    published: Mutex<Vec<(String, DispatchEnvelope)>>,
    notify: Notify,
    subscribers: AtomicUsize,
}

impl Inner {
    fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock().unwrap();
        Arc::clone(
            topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Topic::new(self.partitions_per_topic))),
        )
    }

    /// Lease the first free, non-empty partition and pop its head.
    fn try_take(self: &Arc<Self>, topics: &[String], offset: usize) -> Option<Delivery> {
        for topic_name in topics {
            let topic = self.topic(topic_name);
            let count = topic.partitions.len();

            for i in 0..count {
                let partition = &topic.partitions[(offset + i) % count];
                let Ok(lease) = Arc::clone(&partition.lease).try_lock_owned() else {
                    continue;
                };
                let Some(envelope) = partition.queue.lock().unwrap().pop_front() else {
                    continue;
                };

                let (ack_tx, ack_rx) = oneshot::channel();
                let inner = Arc::clone(self);
                let partition = Arc::clone(partition);
                let requeue = envelope.clone();

                tokio::spawn(async move {
                    if ack_rx.await.is_err() {
                        partition.queue.lock().unwrap().push_front(requeue);
                    }
                    drop(lease);
                    inner.notify.notify_waiters();
                });

                return Some(Delivery::new(envelope, ack_tx));
            }
        }
        None
    }
}

/// Partitioned in-memory broker shared by all clones.
///
/// # Example
///
/// ```
/// use deferred_testing::InMemoryTaskBroker;
///
/// let broker = InMemoryTaskBroker::new();
/// assert!(broker.published().is_empty());
/// ```
#[derive(Clone)]
pub struct InMemoryTaskBroker {
    inner: Arc<Inner>,
}

impl InMemoryTaskBroker {
    /// Broker with [`DEFAULT_PARTITIONS`] partitions per topic.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Broker with `count` partitions per topic (at least one).
    #[must_use]
    pub fn with_partitions(count: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions_per_topic: count.max(1),
                topics: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                notify: Notify::new(),
                subscribers: AtomicUsize::new(0),
            }),
        }
    }

    /// Every envelope ever published, with its topic, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, DispatchEnvelope)> {
        self.inner.published.lock().unwrap().clone()
    }

    /// Envelopes published to one topic.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<DispatchEnvelope> {
        self.inner
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    /// Envelopes waiting in a topic, not yet handed out.
    #[must_use]
    pub fn pending(&self, topic: &str) -> usize {
        self.inner
            .topic(topic)
            .partitions
            .iter()
            .map(|p| p.queue.lock().unwrap().len())
            .sum()
    }

    /// Partition a key is routed to.
    #[must_use]
    pub fn partition_for(&self, topic: &str, key: &str) -> usize {
        self.inner.topic(topic).partition_for(Some(key))
    }
}

impl Default for InMemoryTaskBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskBroker for InMemoryTaskBroker {
    fn publish(
        &self,
        topic: &str,
        envelope: &DispatchEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let topic_name = topic.to_string();
        let envelope = envelope.clone();

        Box::pin(async move {
            let topic = self.inner.topic(&topic_name);
            let slot = topic.partition_for(envelope.partition_marker.as_deref());
            topic.partitions[slot]
                .queue
                .lock()
                .unwrap()
                .push_back(envelope.clone());
            self.inner
                .published
                .lock()
                .unwrap()
                .push((topic_name, envelope));
            self.inner.notify.notify_waiters();
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            let subscriber = inner.subscribers.fetch_add(1, Ordering::Relaxed);

            let stream = async_stream::stream! {
                let mut offset = subscriber;
                loop {
                    let notified = inner.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if let Some(delivery) = inner.try_take(&topics, offset) {
                        offset = offset.wrapping_add(1);
                        yield Ok(delivery);
                        continue;
                    }

                    notified.await;
                }
                #[allow(unreachable_code)]
                ()
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Broker whose every operation fails.
///
/// Counts publish attempts so tests can assert the gate tried exactly once.
#[derive(Clone, Default)]
pub struct FailingTaskBroker {
    attempts: Arc<AtomicUsize>,
}

impl FailingTaskBroker {
    /// Create a failing broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of publish calls so far.
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl TaskBroker for FailingTaskBroker {
    fn publish(
        &self,
        topic: &str,
        _envelope: &DispatchEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::PublishFailed {
                topic,
                reason: "broker unavailable".to_string(),
            })
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, BrokerError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        Box::pin(async move {
            Err(BrokerError::SubscriptionFailed {
                topics,
                reason: "broker unavailable".to_string(),
            })
        })
    }
}
