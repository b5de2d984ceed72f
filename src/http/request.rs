//! Request-side helpers.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) as early as possible
//! - Decode JSON bodies before a handler runs
//! - Enforce the body size limit
//!
//! # Design Decisions
//! - Request ID added by a tower-http layer and echoed on the response
//! - Size limit checked against Content-Length before reading the body
//! - Bodies that are not declared as JSON are ignored, not rejected

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Request};
use serde_json::{Map, Value};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

use crate::error::HandlerError;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Stamps each request with a fresh UUID v4.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// The request ID set by the request-id layer, or "unknown".
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().starts_with("application/json"))
}

/// Read and decode a JSON object body.
///
/// `Ok(None)` when the request does not declare a JSON body or sends an
/// empty one. Oversized bodies fail with 413, undecodable ones with 400.
pub async fn read_json_body(
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> Result<Option<Map<String, Value>>, HandlerError> {
    if !is_json(headers) {
        return Ok(None);
    }

    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(HandlerError::http(413));
    }

    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| HandlerError::http(413))?;
    if bytes.is_empty() {
        return Ok(None);
    }

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) | Err(_) => Err(HandlerError::http_with_reason(400, "Could not decode JSON")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        headers
    }

    #[tokio::test]
    async fn decodes_json_objects() {
        let body = read_json_body(&json_headers(), Body::from(r#"{"token":"abc","n":1}"#), 1024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body["token"], "abc");
    }

    #[tokio::test]
    async fn ignores_other_content_types_and_empty_bodies() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert!(read_json_body(&headers, Body::from("{}"), 1024).await.unwrap().is_none());
        assert!(read_json_body(&json_headers(), Body::empty(), 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_bad_json() {
        for raw in ["{not json", "[1,2,3]"] {
            let err = read_json_body(&json_headers(), Body::from(raw), 1024).await.unwrap_err();
            assert!(matches!(
                err,
                HandlerError::Http { status: 400, reason: Some(ref r) } if r == "Could not decode JSON"
            ));
        }
    }

    #[tokio::test]
    async fn rejects_oversized_bodies() {
        let err = read_json_body(&json_headers(), Body::from(vec![b' '; 64]), 16)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Http { status: 413, .. }));

        let mut headers = json_headers();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("4096"));
        let err = read_json_body(&headers, Body::empty(), 16).await.unwrap_err();
        assert!(matches!(err, HandlerError::Http { status: 413, .. }));
    }

    #[test]
    fn request_id_falls_back_to_unknown() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id(&headers), "unknown");
        headers.insert(X_REQUEST_ID, HeaderValue::from_static("abc"));
        assert_eq!(request_id(&headers), "abc");
    }
}
