//! Task status records and channel notifications.
//!
//! # Lifecycle
//!
//! ```text
//! RECEIVED ──► PROCESSING ──┬──► COMPLETED
//!                           └──► FAILED
//! ```
//!
//! The first write happens when a consumer picks up the envelope. Exactly one
//! terminal write follows. A redelivered envelope replays the same transitions,
//! so the overwrite rules in [`TaskStatusRecord::may_replace`] keep a terminal
//! record from sliding back.

use crate::envelope::TaskId;
use crate::outcome::ReplayOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// `action` field of every status notification.
pub const STATUS_EVENT_ACTION: &str = "async_bg";

/// State of a deferred task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// A consumer picked up the envelope and is replaying it.
    Processing,
    /// The replay produced a response (of any HTTP status).
    Completed,
    /// The replay could not be executed.
    Failed,
}

impl TaskStatus {
    /// Whether no further transition is expected.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one task, keyed by task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    /// Current state.
    pub status: TaskStatus,

    /// Replay outcome when completed, `{"error": ...}` when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// Channel of the caller who deferred the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,

    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
}

impl TaskStatusRecord {
    /// Build a record stamped with the current time.
    #[must_use]
    pub fn new(status: TaskStatus, channel_name: Option<String>, response: Option<Value>) -> Self {
        Self {
            status,
            response,
            channel_name,
            updated_at: Utc::now(),
        }
    }

    /// Record for a task a consumer just picked up.
    #[must_use]
    pub fn processing(channel_name: impl Into<String>) -> Self {
        Self::new(TaskStatus::Processing, Some(channel_name.into()), None)
    }

    /// Terminal record carrying the replay outcome.
    #[must_use]
    pub fn completed(channel_name: impl Into<String>, outcome: &ReplayOutcome) -> Self {
        Self::new(
            TaskStatus::Completed,
            Some(channel_name.into()),
            serde_json::to_value(outcome).ok(),
        )
    }

    /// Terminal record carrying an error summary.
    #[must_use]
    pub fn failed(channel_name: impl Into<String>, error: impl fmt::Display) -> Self {
        Self::new(
            TaskStatus::Failed,
            Some(channel_name.into()),
            Some(serde_json::json!({ "error": error.to_string() })),
        )
    }

    /// Error message of a failed record.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        if self.status != TaskStatus::Failed {
            return None;
        }
        self.response.as_ref()?.get("error")?.as_str()
    }

    /// Replay outcome of a completed record.
    #[must_use]
    pub fn outcome(&self) -> Option<ReplayOutcome> {
        if self.status != TaskStatus::Completed {
            return None;
        }
        serde_json::from_value(self.response.clone()?).ok()
    }

    /// Whether writing `self` over `existing` is allowed.
    ///
    /// - `processing` never replaces a terminal record
    /// - `failed` never replaces `completed`
    /// - `completed` always wins
    #[must_use]
    pub const fn may_replace(&self, existing: &Self) -> bool {
        match (self.status, existing.status) {
            (TaskStatus::Processing, current) => !current.is_terminal(),
            (TaskStatus::Failed, TaskStatus::Completed) => false,
            _ => true,
        }
    }

    /// Record content ignoring the timestamp.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.status == other.status
            && self.response == other.response
            && self.channel_name == other.channel_name
    }
}

/// Lightweight message published on the caller's channel at each transition.
///
/// ```json
/// {"action": "async_bg", "status": "completed", "task_id": "..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Always [`STATUS_EVENT_ACTION`].
    pub action: String,
    /// New state.
    pub status: TaskStatus,
    /// Task the event refers to.
    pub task_id: TaskId,
}

impl StatusEvent {
    /// Build the notification for a transition.
    #[must_use]
    pub fn new(task_id: TaskId, status: TaskStatus) -> Self {
        Self {
            action: STATUS_EVENT_ACTION.to_string(),
            status,
            task_id,
        }
    }
}
