//! Serializable snapshot of an inbound HTTP request.
//!
//! A [`DeferredRequestPayload`] is captured once, when the request is deferred,
//! and travels inside a [`DispatchEnvelope`](crate::envelope::DispatchEnvelope)
//! to the consumer that replays it. It is never mutated after capture.
//!
//! # Wire Format
//!
//! ```json
//! {
//!   "path": "/api/v1/orders/42/",
//!   "query_string": "include=items",
//!   "headers": [["authorization", "Bearer ..."], ["x-async-background-internal", "true"]],
//!   "request_client": ["10.0.0.7", 51234],
//!   "method": "PATCH",
//!   "type": "http",
//!   "http_version": "1.1",
//!   "scheme": "http",
//!   "body": {"data": {"id": "42", "attributes": {"status": "supplied"}}}
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Header a client sends to ask for background execution.
pub const TRIGGER_HEADER: &str = "x-async-background";

/// Header marking a replayed request as system-originated.
///
/// Present with value `"true"` on every replay so that the gate executes it
/// directly instead of deferring it again.
pub const INTERNAL_HEADER: &str = "x-async-background-internal";

/// Address of the client that issued the original request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientAddr {
    /// Structured `[host, port]` pair.
    HostPort(String, u16),
    /// Free-form address string.
    Text(String),
}

/// Protocol kind of the captured request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Plain request/response.
    #[default]
    Http,
    /// Upgrade to a stream.
    Websocket,
}

/// Body of a captured request.
///
/// Arbitrary JSON is accepted at the boundary, but it is classified so that
/// callers can ask for the ordering key without re-inspecting raw values.
///
/// On the wire the body is always a JSON value. [`RequestBody::Absent`] is
/// written as an empty mapping, so a payload that crossed the broker decodes
/// it as an empty [`RequestBody::Object`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// JSON object.
    Object(Map<String, Value>),
    /// JSON array (typically a list of objects for bulk operations).
    Array(Vec<Value>),
    /// Any other JSON value (string, number, boolean).
    Scalar(Value),
    /// No body was sent.
    Absent,
}

impl RequestBody {
    /// Decode raw request bytes.
    ///
    /// Never fails: empty input is [`RequestBody::Absent`] and anything that
    /// is not valid JSON falls back to an empty object.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::Absent;
        }

        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::from(value),
            Err(e) => {
                tracing::debug!(error = %e, len = bytes.len(), "Request body is not JSON, using empty object");
                Self::Object(Map::new())
            },
        }
    }

    /// Re-serialize the body for replay.
    ///
    /// The replayed request always carries a JSON body; an absent body becomes `{}`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&Value::from(self.clone())).unwrap_or_else(|_| b"{}".to_vec())
    }

    /// Identifier of the resource this request targets, if any.
    ///
    /// Looks up `data.id` in an object body. String ids are used verbatim and
    /// integer ids are rendered in decimal; every other shape yields `None`.
    #[must_use]
    pub fn resource_id(&self) -> Option<String> {
        let Self::Object(map) = self else {
            return None;
        };

        match map.get("data")?.get("id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) if id.is_i64() || id.is_u64() => Some(id.to_string()),
            _ => None,
        }
    }

    /// Whether the body carries no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Object(map) => map.is_empty(),
            Self::Array(items) => items.is_empty(),
            Self::Scalar(_) => false,
            Self::Absent => true,
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::Object(Map::new())
    }
}

impl From<Value> for RequestBody {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Object(map),
            Value::Array(items) => Self::Array(items),
            Value::Null => Self::Absent,
            scalar => Self::Scalar(scalar),
        }
    }
}

impl From<RequestBody> for Value {
    fn from(body: RequestBody) -> Self {
        match body {
            RequestBody::Object(map) => Self::Object(map),
            RequestBody::Array(items) => Self::Array(items),
            RequestBody::Scalar(value) => value,
            RequestBody::Absent => Self::Object(Map::new()),
        }
    }
}

impl Serialize for RequestBody {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Object(map) => map.serialize(serializer),
            Self::Array(items) => items.serialize(serializer),
            Self::Scalar(value) => value.serialize(serializer),
            Self::Absent => Map::<String, Value>::new().serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for RequestBody {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(|value| match value {
            // A null that crossed the wire means "nothing usable": same as invalid input.
            Value::Null => Self::default(),
            other => Self::from(other),
        })
    }
}

/// Immutable snapshot of one inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredRequestPayload {
    /// Request path, without the query string.
    pub path: String,

    /// Raw query string (no leading `?`).
    pub query_string: String,

    /// Header pairs in arrival order, duplicates preserved.
    pub headers: Vec<(String, String)>,

    /// Client address, when the server knew it.
    pub request_client: Option<ClientAddr>,

    /// HTTP method.
    pub method: String,

    /// Protocol kind.
    #[serde(rename = "type")]
    pub kind: RequestKind,

    /// HTTP version (`1.0`, `1.1`, `2`, `3`).
    pub http_version: String,

    /// URL scheme.
    pub scheme: String,

    /// Request body.
    #[serde(default)]
    pub body: RequestBody,
}

impl DeferredRequestPayload {
    /// Ordering key for the broker: the id of the targeted resource.
    #[must_use]
    pub fn partition_marker(&self) -> Option<String> {
        self.body.resource_id()
    }

    /// First value of a header, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the snapshot carries the replay marker.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.header(INTERNAL_HEADER)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    /// Path and query joined the way they appear in a request line.
    #[must_use]
    pub fn path_and_query(&self) -> String {
        if self.query_string.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query_string)
        }
    }
}
