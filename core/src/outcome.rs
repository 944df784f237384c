//! Captured result of replaying a deferred request.

use crate::envelope::TaskId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of executing a captured request against the application.
///
/// Stored verbatim as the `response` of a completed task status record:
///
/// ```json
/// {
///   "task_id": "2526046e-5d7a-41fb-a058-935b602726a9",
///   "endpoint": "/api/v1/some-async-endpoint/",
///   "status": 200,
///   "headers": [["content-type", "application/json"]],
///   "response": [{"some_str": "asdf"}]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayOutcome {
    /// Task this outcome belongs to.
    pub task_id: TaskId,

    /// Path of the original request.
    pub endpoint: String,

    /// HTTP status code of the replayed response.
    pub status: u16,

    /// Response headers in the order the application produced them.
    pub headers: Vec<(String, String)>,

    /// Response body: parsed JSON, or the raw text when it is not JSON.
    pub response: Value,
}
