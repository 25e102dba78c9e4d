//! Inbound request buffering and per-backend outbound request preparation.
//!
//! # Responsibilities
//! - Buffer the client body once so every attempt can replay it
//! - Resolve the target URL (base path prefix + client path + query)
//! - Apply the backend's model override and protocol conversion
//! - Copy client headers, replacing credentials with the backend token
//!
//! # Design Decisions
//! - The original body is never mutated; each attempt builds its own copy
//! - A conversion failure is reported, never answered by sending the
//!   unconverted body to a backend that cannot read it

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use url::Url;

use crate::config::{BackendConfig, Platform};
use crate::http::error::{AttemptError, BodyError};
use crate::protocol;
use crate::resilience::is_streaming_request;

pub const MESSAGES_PATH: &str = "/v1/messages";
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Codings the proxy can decode when it has to rewrite a response.
pub const DECODABLE_ENCODINGS: &str = "gzip, zstd";

/// Headers that describe one connection and never cross the proxy.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// The client request with its body fully buffered.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    pub async fn from_request(request: Request<Body>, limit: usize) -> Result<Self, BodyError> {
        let (parts, body) = request.into_parts();

        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(BodyError::TooLarge { limit });
        }

        // Chunked bodies carry no length, so the limit is enforced while reading.
        let mut buf = BytesMut::new();
        let mut frames = body.into_data_stream();
        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(BodyError::Read)?;
            if buf.len() + frame.len() > limit {
                return Err(BodyError::TooLarge { limit });
            }
            buf.extend_from_slice(&frame);
        }
        let body = buf.freeze();

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        })
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Requests that go through protocol conversion on chat-completions backends.
    pub fn is_messages_endpoint(&self) -> bool {
        self.path().trim_end_matches('/').ends_with(MESSAGES_PATH)
    }

    /// `model` field of the body, if it is a JSON object that has one.
    pub fn model(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        value.get("model")?.as_str().map(str::to_string)
    }
}

/// Base URL path + client path + query. Chat-completions backends get
/// `/v1/messages` rewritten to `/v1/chat/completions`.
pub fn target_url(base: &Url, path: &str, query: Option<&str>, platform: Platform) -> Url {
    let mut joined = format!("{}{}", base.path().trim_end_matches('/'), path);
    if platform == Platform::OpenAi {
        let trimmed = joined.trim_end_matches('/');
        if let Some(prefix) = trimmed.strip_suffix(MESSAGES_PATH) {
            joined = format!("{prefix}{CHAT_COMPLETIONS_PATH}");
        }
    }

    let mut url = base.clone();
    url.set_path(&joined);
    url.set_query(query);
    url
}

/// Overwrite the top-level `model` field. Non-object bodies are left alone.
pub fn apply_model_override(body: &Bytes, model: &str) -> Bytes {
    let Ok(serde_json::Value::Object(mut map)) = serde_json::from_slice(body) else {
        return body.clone();
    };
    map.insert("model".to_string(), serde_json::Value::String(model.to_string()));
    match serde_json::to_vec(&map) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body.clone(),
    }
}

/// Client headers minus hop-by-hop, `Host` and `Content-Length`, with the
/// backend token as credentials.
pub fn outbound_headers(inbound: &HeaderMap, token: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Ok(bearer) = HeaderValue::from_str(&format!("Bearer {token}")) {
        headers.insert(header::AUTHORIZATION, bearer);
    }
    // Native clients may authenticate with x-api-key instead.
    let api_key = HeaderName::from_static("x-api-key");
    if headers.contains_key(&api_key) {
        match HeaderValue::from_str(token) {
            Ok(value) => {
                headers.insert(api_key, value);
            }
            Err(_) => {
                headers.remove(api_key);
            }
        }
    }
    headers
}

/// Everything needed to send one attempt.
#[derive(Debug)]
pub struct PreparedRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub streaming: bool,
    pub converts: bool,
}

/// Build the attempt for `backend`. Errors here count as local failures.
pub fn prepare(inbound: &InboundRequest, backend: &BackendConfig) -> Result<PreparedRequest, AttemptError> {
    let base = Url::parse(&backend.base_url).map_err(|source| AttemptError::InvalidBaseUrl {
        backend: backend.name.clone(),
        source,
    })?;
    let url = target_url(&base, inbound.path(), inbound.query(), backend.platform);

    let mut body = match &backend.model {
        Some(model) => apply_model_override(&inbound.body, model),
        None => inbound.body.clone(),
    };

    let converts = backend.platform == Platform::OpenAi && inbound.is_messages_endpoint();
    if converts {
        body = protocol::convert_request(&body)
            .map(Bytes::from)
            .map_err(|source| AttemptError::Conversion {
                backend: backend.name.clone(),
                source,
            })?;
    }

    let mut headers = outbound_headers(&inbound.headers, &backend.token);
    if converts {
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(DECODABLE_ENCODINGS));
    }

    Ok(PreparedRequest {
        url,
        headers,
        streaming: is_streaming_request(&body),
        body,
        converts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(platform: Platform, model: Option<&str>) -> BackendConfig {
        BackendConfig {
            name: "b".into(),
            base_url: "https://api.example.com/prefix/".into(),
            token: "sk-backend".into(),
            enabled: true,
            model: model.map(str::to_string),
            platform,
        }
    }

    fn inbound(path: &str, body: &str) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer client"));
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        InboundRequest {
            method: Method::POST,
            uri: path.parse().unwrap(),
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn target_url_keeps_prefix_and_query() {
        let base = Url::parse("https://api.example.com/prefix/").unwrap();
        let url = target_url(&base, "/v1/messages", Some("beta=true"), Platform::Anthropic);
        assert_eq!(url.as_str(), "https://api.example.com/prefix/v1/messages?beta=true");
    }

    #[test]
    fn target_url_rewrites_messages_for_chat_backends() {
        let base = Url::parse("http://127.0.0.1:9000").unwrap();
        let url = target_url(&base, "/v1/messages", None, Platform::OpenAi);
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/v1/chat/completions");

        let other = target_url(&base, "/v1/models", None, Platform::OpenAi);
        assert_eq!(other.path(), "/v1/models");
    }

    #[test]
    fn model_override_only_touches_objects() {
        let body = Bytes::from_static(br#"{"model":"claude-3-haiku-20240307","max_tokens":5}"#);
        let out: serde_json::Value =
            serde_json::from_slice(&apply_model_override(&body, "custom")).unwrap();
        assert_eq!(out["model"], "custom");
        assert_eq!(out["max_tokens"], 5);

        let array = Bytes::from_static(b"[1,2]");
        assert_eq!(apply_model_override(&array, "custom"), array);
    }

    #[test]
    fn headers_swap_credentials_and_drop_hop_by_hop() {
        let mut inbound_headers = inbound("/", "").headers;
        inbound_headers.insert("x-api-key", HeaderValue::from_static("client-key"));
        let headers = outbound_headers(&inbound_headers, "sk-backend");

        assert_eq!(headers[header::AUTHORIZATION], "Bearer sk-backend");
        assert_eq!(headers["x-api-key"], "sk-backend");
        assert_eq!(headers["anthropic-version"], "2023-06-01");
        assert!(!headers.contains_key(header::HOST));
        assert!(!headers.contains_key(header::CONTENT_LENGTH));
        assert!(!headers.contains_key(header::CONNECTION));
    }

    #[test]
    fn prepare_converts_for_chat_backends() {
        let req = inbound(
            "/v1/messages",
            r#"{"model":"claude-3-opus-20240229","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
        );
        let prepared = prepare(&req, &backend(Platform::OpenAi, None)).unwrap();

        assert!(prepared.converts);
        assert!(prepared.streaming);
        assert_eq!(prepared.url.path(), "/prefix/v1/chat/completions");
        let body: serde_json::Value = serde_json::from_slice(&prepared.body).unwrap();
        assert_eq!(body["model"], "gpt-4-turbo");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn converting_requests_only_accept_decodable_encodings() {
        let mut req = inbound(
            "/v1/messages",
            r#"{"model":"claude-3-opus-20240229","messages":[{"role":"user","content":"hi"}]}"#,
        );
        req.headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br, deflate"));

        let converted = prepare(&req, &backend(Platform::OpenAi, None)).unwrap();
        assert_eq!(converted.headers[header::ACCEPT_ENCODING], "gzip, zstd");

        let native = prepare(&req, &backend(Platform::Anthropic, None)).unwrap();
        assert_eq!(native.headers[header::ACCEPT_ENCODING], "br, deflate");
    }

    #[tokio::test]
    async fn chunked_body_over_limit_is_too_large() {
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"0123456789")),
        ];
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/messages")
            .body(Body::from_stream(futures_util::stream::iter(chunks)))
            .unwrap();

        let err = InboundRequest::from_request(request, 15).await.unwrap_err();
        assert!(matches!(err, BodyError::TooLarge { limit: 15 }));
    }

    #[tokio::test]
    async fn chunked_body_within_limit_is_buffered() {
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"{\"model\":")),
            Ok(Bytes::from_static(b"\"m\"}")),
        ];
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/messages")
            .body(Body::from_stream(futures_util::stream::iter(chunks)))
            .unwrap();

        let inbound = InboundRequest::from_request(request, 64).await.unwrap();
        assert_eq!(inbound.model().as_deref(), Some("m"));
    }

    #[test]
    fn prepare_applies_override_before_conversion() {
        let req = inbound(
            "/v1/messages",
            r#"{"model":"claude-3-opus-20240229","messages":[{"role":"user","content":"hi"}]}"#,
        );
        let prepared = prepare(&req, &backend(Platform::OpenAi, Some("qwen-max"))).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&prepared.body).unwrap();
        assert_eq!(body["model"], "qwen-max");
        assert!(!prepared.streaming);
    }

    #[test]
    fn prepare_reports_conversion_failure() {
        let req = inbound("/v1/messages", r#"{"messages":"nope"}"#);
        let err = prepare(&req, &backend(Platform::OpenAi, None)).unwrap_err();
        assert!(matches!(err, AttemptError::Conversion { .. }));
    }

    #[test]
    fn native_backends_get_the_body_verbatim() {
        let raw = r#"{"model":"claude-3-opus-20240229",  "messages":[]}"#;
        let prepared = prepare(&inbound("/v1/messages", raw), &backend(Platform::Anthropic, None)).unwrap();
        assert!(!prepared.converts);
        assert_eq!(prepared.body, Bytes::from(raw));
    }
}
