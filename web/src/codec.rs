//! Request capture and replay.
//!
//! Three transforms, one per hop of a deferred call:
//!
//! | function | from | to |
//! |----------|------|----|
//! | [`capture`] | live request parts + buffered body | [`DeferredRequestPayload`] |
//! | [`synthetic_request`] | payload | `Request<Body>` for the in-process app |
//! | [`collect_response`] | app `Response` | [`ReplayOutcome`] |
//!
//! Capture never fails: an undecodable body becomes an empty object and
//! headers that are not valid UTF-8 are dropped. Replay is strict: a payload
//! that cannot be turned back into a request is a [`CodecError`].

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{
        header::{CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE},
        request::Parts,
        HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version,
    },
    response::Response,
};
use deferred_core::{
    ClientAddr, DeferredRequestPayload, RequestBody, RequestKind, ReplayOutcome, TaskId,
    INTERNAL_HEADER, TRIGGER_HEADER,
};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Replay-side codec failure.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The captured method is not a valid HTTP method.
    #[error("Invalid method in payload: {0:?}")]
    InvalidMethod(String),

    /// The captured path and query do not form a valid URI.
    #[error("Invalid URI {uri:?}: {reason}")]
    InvalidUri {
        /// Offending URI
        uri: String,
        /// Parser message
        reason: String,
    },

    /// A captured header cannot be put back on a request.
    #[error("Invalid header {name:?} in payload")]
    InvalidHeader {
        /// Header name
        name: String,
    },

    /// Building the request failed.
    #[error("Failed to build request: {0}")]
    Request(#[from] axum::http::Error),

    /// Reading the application's response body failed.
    #[error("Failed to read response body: {0}")]
    ResponseBody(String),
}

/// Snapshot a live request.
///
/// `body` is the already-buffered request body. Headers are copied in order,
/// except the trigger header and any client-sent marker; the replay marker
/// is then appended exactly once.
#[must_use]
pub fn capture(parts: &Parts, body: &[u8]) -> DeferredRequestPayload {
    let mut headers = Vec::with_capacity(parts.headers.len() + 1);
    for (name, value) in &parts.headers {
        let name = name.as_str();
        if name.eq_ignore_ascii_case(TRIGGER_HEADER) || name.eq_ignore_ascii_case(INTERNAL_HEADER)
        {
            continue;
        }
        match std::str::from_utf8(value.as_bytes()) {
            Ok(value) => headers.push((name.to_string(), value.to_string())),
            Err(e) => tracing::warn!(header = name, error = %e, "Skipping non UTF-8 header"),
        }
    }
    headers.push((INTERNAL_HEADER.to_string(), "true".to_string()));

    let kind = if is_websocket_upgrade(&parts.headers) {
        RequestKind::Websocket
    } else {
        RequestKind::Http
    };

    let request_client = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| ClientAddr::HostPort(addr.ip().to_string(), addr.port()));

    DeferredRequestPayload {
        path: parts.uri.path().to_string(),
        query_string: parts.uri.query().unwrap_or_default().to_string(),
        headers,
        request_client,
        method: parts.method.as_str().to_string(),
        kind,
        http_version: version_label(parts.version).to_string(),
        scheme: parts.uri.scheme_str().unwrap_or("http").to_string(),
        body: RequestBody::decode(body),
    }
}

/// Rebuild an in-process request from a payload.
///
/// The body is one chunk: the payload body re-serialized as JSON. Framing
/// headers from the original request are replaced to match it.
///
/// # Errors
///
/// Returns [`CodecError`] if the method, URI or a header cannot be parsed.
pub fn synthetic_request(payload: &DeferredRequestPayload) -> Result<Request<Body>, CodecError> {
    let method = Method::from_bytes(payload.method.as_bytes())
        .map_err(|_| CodecError::InvalidMethod(payload.method.clone()))?;

    let path_and_query = payload.path_and_query();
    let uri: Uri = path_and_query.parse().map_err(|e: axum::http::uri::InvalidUri| {
        CodecError::InvalidUri {
            uri: path_and_query.clone(),
            reason: e.to_string(),
        }
    })?;

    let mut headers = HeaderMap::with_capacity(payload.headers.len() + 1);
    for (name, value) in &payload.headers {
        let invalid = || CodecError::InvalidHeader { name: name.clone() };
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        if header_name == CONTENT_LENGTH || header_name == TRANSFER_ENCODING {
            continue;
        }
        let header_value = HeaderValue::from_bytes(value.as_bytes()).map_err(|_| invalid())?;
        headers.append(header_name, header_value);
    }

    let body = payload.body.to_bytes();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .version(parse_version(&payload.http_version))
        .body(Body::from(body))?;
    *request.headers_mut() = headers;

    if let Some(addr) = payload.request_client.as_ref().and_then(socket_addr) {
        request.extensions_mut().insert(ConnectInfo(addr));
    }

    Ok(request)
}

/// Drain an application response into a [`ReplayOutcome`].
///
/// Header values are decoded as UTF-8, falling back to Latin-1. The body is
/// parsed as JSON, falling back to (lossy) text.
///
/// # Errors
///
/// Returns [`CodecError::ResponseBody`] if the body stream fails.
pub async fn collect_response(
    task_id: TaskId,
    endpoint: &str,
    response: Response,
) -> Result<ReplayOutcome, CodecError> {
    let (parts, body) = response.into_parts();

    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), decode_header_value(value.as_bytes())))
        .collect();

    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| CodecError::ResponseBody(e.to_string()))?;

    let response = serde_json::from_slice::<Value>(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

    Ok(ReplayOutcome {
        task_id,
        endpoint: endpoint.to_string(),
        status: parts.status.as_u16(),
        headers,
        response,
    })
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

fn parse_version(label: &str) -> Version {
    match label {
        "0.9" => Version::HTTP_09,
        "1.0" => Version::HTTP_10,
        "2" | "2.0" => Version::HTTP_2,
        "3" | "3.0" => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}

fn socket_addr(client: &ClientAddr) -> Option<SocketAddr> {
    match client {
        ClientAddr::HostPort(host, port) => {
            host.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, *port))
        },
        ClientAddr::Text(text) => text.parse().ok(),
    }
}

/// UTF-8, else one char per byte.
fn decode_header_value(bytes: &[u8]) -> String {
    std::str::from_utf8(bytes).map_or_else(
        |_| bytes.iter().copied().map(char::from).collect(),
        str::to_string,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use proptest::prelude::*;
    use serde_json::json;

    fn parts(request: Request<()>) -> Parts {
        request.into_parts().0
    }

    #[test]
    fn capture_drops_trigger_and_appends_marker() {
        let parts = parts(
            Request::builder()
                .method("PATCH")
                .uri("/api/v1/orders/42/?include=items")
                .header("authorization", "Bearer t")
                .header("X-Async-Background", "1")
                .header("accept", "a")
                .header("accept", "b")
                .body(())
                .unwrap(),
        );

        let payload = capture(&parts, br#"{"data": {"id": "42"}}"#);

        assert_eq!(payload.method, "PATCH");
        assert_eq!(payload.path, "/api/v1/orders/42/");
        assert_eq!(payload.query_string, "include=items");
        assert_eq!(payload.scheme, "http");
        assert_eq!(payload.http_version, "1.1");
        assert_eq!(payload.kind, RequestKind::Http);
        assert!(payload.header(TRIGGER_HEADER).is_none());
        assert_eq!(
            payload.headers.last(),
            Some(&(INTERNAL_HEADER.to_string(), "true".to_string()))
        );
        let accepts: Vec<_> = payload
            .headers
            .iter()
            .filter(|(name, _)| name == "accept")
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(accepts, vec!["a", "b"]);
        assert_eq!(payload.partition_marker().as_deref(), Some("42"));
    }

    #[test]
    fn capture_skips_non_utf8_headers() {
        let mut request = Request::builder().uri("/x/").body(()).unwrap();
        request
            .headers_mut()
            .insert("x-latin", HeaderValue::from_bytes(&[0xE9]).unwrap());

        let payload = capture(&parts(request), b"");
        assert!(payload.header("x-latin").is_none());
        assert!(payload.body.is_empty());
    }

    #[test]
    fn capture_keeps_utf8_header_values() {
        let mut request = Request::builder().uri("/files/").body(()).unwrap();
        request.headers_mut().insert(
            "x-file-name",
            HeaderValue::from_bytes("résumé.pdf".as_bytes()).unwrap(),
        );

        let payload = capture(&parts(request), b"");
        assert_eq!(payload.header("x-file-name"), Some("résumé.pdf"));

        let replayed = synthetic_request(&payload).unwrap();
        assert_eq!(
            replayed.headers()["x-file-name"].as_bytes(),
            "résumé.pdf".as_bytes()
        );
    }

    #[test]
    fn capture_detects_websocket_and_client() {
        let mut request = Request::builder()
            .uri("/ws/")
            .header("upgrade", "WebSocket")
            .body(())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 51234))));

        let payload = capture(&parts(request), b"");
        assert_eq!(payload.kind, RequestKind::Websocket);
        assert_eq!(
            payload.request_client,
            Some(ClientAddr::HostPort("10.0.0.7".to_string(), 51234))
        );
    }

    #[tokio::test]
    async fn synthetic_request_replays_payload() {
        let original = parts(
            Request::builder()
                .method("PATCH")
                .uri("/api/v1/shops/5/?a=1")
                .header("content-type", "application/json")
                .header("content-length", "999")
                .header("x-async-background", "")
                .body(())
                .unwrap(),
        );
        let payload = capture(&original, br#"{"data": {"id": 5}}"#);

        let request = synthetic_request(&payload).unwrap();
        assert_eq!(request.method(), Method::PATCH);
        assert_eq!(request.uri(), "/api/v1/shops/5/?a=1");
        assert_eq!(request.headers()[INTERNAL_HEADER], "true");
        assert!(request.headers().get(TRIGGER_HEADER).is_none());

        let expected = payload.body.to_bytes();
        assert_eq!(
            request.headers()[CONTENT_LENGTH],
            expected.len().to_string().as_str()
        );
        let body = axum::body::to_bytes(request.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), expected.as_slice());
    }

    #[tokio::test]
    async fn absent_body_replays_as_empty_object() {
        let payload = capture(&parts(Request::get("/x/").body(()).unwrap()), b"");
        let request = synthetic_request(&payload).unwrap();
        let body = axum::body::to_bytes(request.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"{}");
    }

    #[test]
    fn synthetic_request_restores_client_and_version() {
        let mut payload = capture(&parts(Request::get("/x/").body(()).unwrap()), b"");
        payload.request_client = Some(ClientAddr::HostPort("127.0.0.1".to_string(), 5000));
        payload.http_version = "1.0".to_string();

        let request = synthetic_request(&payload).unwrap();
        assert_eq!(request.version(), Version::HTTP_10);
        let ConnectInfo(addr) = request.extensions().get::<ConnectInfo<SocketAddr>>().unwrap();
        assert_eq!(addr.port(), 5000);
    }

    #[test]
    fn synthetic_request_rejects_bad_method() {
        let mut payload = capture(&parts(Request::get("/x/").body(()).unwrap()), b"");
        payload.method = "GE T".to_string();
        assert!(matches!(
            synthetic_request(&payload),
            Err(CodecError::InvalidMethod(_))
        ));
    }

    #[tokio::test]
    async fn collect_response_parses_json_and_text() {
        let task_id = TaskId::new();

        let json_response = (StatusCode::CREATED, axum::Json(json!([{"some_str": "asdf"}])))
            .into_response();
        let outcome = collect_response(task_id, "/api/v1/x/", json_response).await.unwrap();
        assert_eq!(outcome.status, 201);
        assert_eq!(outcome.endpoint, "/api/v1/x/");
        assert_eq!(outcome.response, json!([{"some_str": "asdf"}]));
        assert!(outcome
            .headers
            .iter()
            .any(|(name, value)| name == "content-type" && value == "application/json"));

        let text_response = (StatusCode::BAD_REQUEST, "plain failure").into_response();
        let outcome = collect_response(task_id, "/x/", text_response).await.unwrap();
        assert_eq!(outcome.status, 400);
        assert_eq!(outcome.response, json!("plain failure"));
    }

    #[test]
    fn header_values_fall_back_to_latin1() {
        assert_eq!(decode_header_value(b"plain"), "plain");
        assert_eq!(decode_header_value(&[0x63, 0x61, 0x66, 0xE9]), "caf\u{e9}");
    }

    proptest! {
        #[test]
        fn capture_never_keeps_trigger(value in "[a-zA-Z0-9]{0,16}", body in proptest::collection::vec(any::<u8>(), 0..64)) {
            let request = Request::builder()
                .uri("/p/")
                .header(TRIGGER_HEADER, value.as_str())
                .body(())
                .unwrap();
            let payload = capture(&parts(request), &body);

            prop_assert!(payload.header(TRIGGER_HEADER).is_none());
            prop_assert!(payload.is_internal());
            prop_assert!(synthetic_request(&payload).is_ok());
        }

        #[test]
        fn latin1_fallback_keeps_one_char_per_byte(bytes in proptest::collection::vec(any::<u8>(), 0..32)) {
            let decoded = decode_header_value(&bytes);
            if std::str::from_utf8(&bytes).is_err() {
                prop_assert_eq!(decoded.chars().count(), bytes.len());
            }
        }
    }
}
