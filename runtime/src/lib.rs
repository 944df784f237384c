//! # Deferred Runtime
//!
//! Consumer-side runtime for deferred request execution.
//!
//! - [`consumer`]: subscribe-process-reconnect loop with graceful shutdown
//! - [`handler`]: the [`EnvelopeHandler`] trait a replay executor implements
//! - [`retry`]: redelivery policy with exponential backoff
//!
//! ## Delivery Semantics
//!
//! Each consumer handles one delivery at a time. A failed envelope is
//! redelivered in-process until it succeeds or the [`RetryPolicy`] gives up;
//! only then is it acknowledged. Because the broker leases a partition until
//! acknowledgement, envelopes that share an ordering key are never handled
//! concurrently or out of order, whatever the number of consumers.
//!
//! ## Example
//!
//! ```rust,ignore
//! use deferred_runtime::{spawn_consumer_pool, ConsumerPoolConfig};
//!
//! let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
//! let config = ConsumerPoolConfig::new("replay", vec!["async-request".to_string()]);
//! let handles = spawn_consumer_pool(10, &config, &broker, &executor, &shutdown_tx);
//!
//! // later
//! let _ = shutdown_tx.send(());
//! deferred_runtime::await_shutdown(handles, Duration::from_secs(10)).await;
//! ```

pub mod consumer;
pub mod handler;
pub mod retry;

pub use consumer::{
    await_shutdown, spawn_consumer_pool, ConsumerError, ConsumerPoolConfig, TaskConsumer,
    TaskConsumerBuilder,
};
pub use handler::{EnvelopeHandler, HandlerError};
pub use retry::RetryPolicy;
