//! # Deferred Core
//!
//! Core types and traits for deferring HTTP requests to background execution.
//!
//! A caller opts in per request with the [`TRIGGER_HEADER`](payload::TRIGGER_HEADER).
//! The request is captured as a [`DeferredRequestPayload`], wrapped in a
//! [`DispatchEnvelope`] and published through a [`TaskBroker`]. A consumer
//! replays it against the in-process application and records the outcome in a
//! [`StatusStore`], notifying the caller's channel at every transition.
//!
//! ## Data Flow
//!
//! ```text
//! caller ──► gate ──► payload ──► dispatcher ──► broker (partitioned)
//!                                                   │
//!                                                   ▼
//! caller ◄── store + channel ◄── notifier ◄── replay executor ──► app
//! ```
//!
//! This crate holds only the data model and the infrastructure seams.
//! Implementations live in sibling crates:
//!
//! - `deferred-redpanda` - Kafka-compatible [`TaskBroker`]
//! - `deferred-redis` - Redis-backed [`StatusStore`]
//! - `deferred-testing` - in-memory implementations of both
//! - `deferred-web` - axum integration (gate, replay, result endpoint)

pub mod broker;
pub mod envelope;
pub mod outcome;
pub mod payload;
pub mod status;
pub mod store;

pub use broker::{BrokerError, Delivery, DeliveryStream, TaskBroker};
pub use envelope::{DispatchEnvelope, TaskId};
pub use outcome::ReplayOutcome;
pub use payload::{
    ClientAddr, DeferredRequestPayload, RequestBody, RequestKind, INTERNAL_HEADER, TRIGGER_HEADER,
};
pub use status::{StatusEvent, TaskStatus, TaskStatusRecord, STATUS_EVENT_ACTION};
pub use store::{NotificationStream, StatusStore, StoreError};
