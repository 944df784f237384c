//! Broker message wrapping a deferred request.

use crate::payload::DeferredRequestPayload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique handle for one deferred call.
///
/// Returned to the caller in the 202 response and used as the key of the
/// task status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new random task id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Message published to the broker for one deferred call.
///
/// Envelopes sharing a `partition_marker` are delivered to a single consumer
/// in publish order. Envelopes without one have no ordering guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    /// Task identifier handed back to the caller.
    pub task_id: TaskId,

    /// Channel that receives status notifications for this task.
    pub channel_name: String,

    /// Captured request.
    pub payload: DeferredRequestPayload,

    /// Ordering key (the targeted resource id), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_marker: Option<String>,
}

impl DispatchEnvelope {
    /// Build an envelope with a freshly generated task id.
    #[must_use]
    pub fn new(
        channel_name: impl Into<String>,
        payload: DeferredRequestPayload,
        partition_marker: Option<String>,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            channel_name: channel_name.into(),
            payload,
            partition_marker,
        }
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid envelope.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
