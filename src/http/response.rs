//! Response construction toward the client.
//!
//! # Responsibilities
//! - Copy upstream status and headers, stripping hop-by-hop headers
//! - Drop `Content-Encoding`/`Content-Length` when the body was rewritten
//! - Synthesize the gateway error once every backend has been tried

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::http::error::AttemptError;
use crate::http::request::is_hop_by_hop;

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("text/event-stream"))
}

/// Upstream headers fit for the client. `body_rewritten` drops the headers
/// that describe the upstream bytes rather than the ones we send.
pub fn client_headers(upstream: &HeaderMap, body_rewritten: bool) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name) {
            continue;
        }
        if body_rewritten && (name == header::CONTENT_ENCODING || name == header::CONTENT_LENGTH) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

pub fn build(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Rewritten JSON body with upstream status and headers.
pub fn json_body(status: StatusCode, upstream: &HeaderMap, body: Vec<u8>) -> Response {
    let mut headers = client_headers(upstream, true);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    build(status, headers, Body::from(body))
}

/// 502 naming the last failure.
pub fn gateway_error(last: Option<&AttemptError>) -> Response {
    let detail = last
        .map(ToString::to_string)
        .unwrap_or_else(|| "no enabled backends".to_string());
    (
        StatusCode::BAD_GATEWAY,
        format!("all upstream backends unavailable: {detail}"),
    )
        .into_response()
}

pub fn conversion_failure(backend: &str, error: &crate::protocol::ConversionError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("failed to convert response from backend {backend}: {error}"),
    )
        .into_response()
}
