//! # Deferred Testing
//!
//! In-memory infrastructure and helpers for testing deferred request
//! execution without a broker or Redis.
//!
//! - [`InMemoryTaskBroker`]: partitioned broker with per-partition leases
//! - [`FailingTaskBroker`]: broker whose every call fails
//! - [`InMemoryStatusStore`]: status records plus channel pub/sub
//! - [`fixtures`]: payload builders and polling helpers
//!
//! ## Example
//!
//! ```ignore
//! use deferred_testing::{InMemoryStatusStore, InMemoryTaskBroker, fixtures};
//!
//! #[tokio::test]
//! async fn deferred_call_completes() {
//!     let broker = Arc::new(InMemoryTaskBroker::new());
//!     let store = Arc::new(InMemoryStatusStore::new());
//!     // ... wire the gate and a consumer pool ...
//!     let record = fixtures::wait_for_terminal(&*store, task_id, Duration::from_secs(5)).await;
//!     assert_eq!(record.unwrap().status, TaskStatus::Completed);
//! }
//! ```

pub mod broker;
pub mod fixtures;
pub mod store;

pub use broker::{FailingTaskBroker, InMemoryTaskBroker};
pub use fixtures::{payload, wait_for_all_terminal, wait_for_terminal};
pub use store::InMemoryStatusStore;
