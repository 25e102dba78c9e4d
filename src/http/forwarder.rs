//! Request forwarding with ordered failover.
//!
//! # Responsibilities
//! - Buffer the client request once
//! - Walk the breaker's candidate order, one attempt at a time
//! - Classify each upstream answer and report it to the breaker
//! - Return the first usable response, or a 502 once every candidate failed
//!
//! # Design Decisions
//! - Every attempt ends in exactly one `AttemptOutcome`
//! - The breaker lock is never held across an await; half-open trials are
//!   carried as a `TrialPermit` that returns its slot if left unsettled
//! - Streaming attempts have no deadline, only the client's connect timeout

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::ProxyConfig;
use crate::http::compression;
use crate::http::error::{snippet, AttemptError, BodyError};
use crate::http::relay::{self, RelayMode};
use crate::http::request::{prepare, InboundRequest, PreparedRequest};
use crate::http::response;
use crate::observability::metrics;
use crate::protocol;
use crate::resilience::{
    attempt_deadline, classify, parse_retry_after, Admission, Candidate, CircuitBreaker, Disposition,
    TrialPermit,
};

/// Longest upstream error body kept for logs and the 502 summary.
const ERROR_BODY_CHARS: usize = 500;

/// Per-request knobs taken from config at startup.
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub max_attempts: Option<u32>,
    pub timeout: Duration,
    pub max_body_bytes: usize,
}

impl From<&ProxyConfig> for ForwarderSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_attempts: config.retry.max_attempts,
            timeout: Duration::from_secs(config.retry.timeout_seconds),
            max_body_bytes: config.limits.max_body_bytes,
        }
    }
}

/// Result of one attempt.
pub enum AttemptOutcome {
    /// Hand this response to the client; stop trying.
    Respond(Response),
    /// Move on to the next candidate.
    Retry(AttemptError),
}

/// Shared upstream client. No overall timeout: deadlines are per request.
pub fn build_client(config: &ProxyConfig) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.retry.connect_timeout_seconds))
        .pool_idle_timeout(Duration::from_secs(config.upstream.pool_idle_timeout_seconds));
    if !config.upstream.system_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    settings: ForwarderSettings,
}

impl Forwarder {
    pub fn new(client: reqwest::Client, breaker: Arc<CircuitBreaker>, settings: ForwarderSettings) -> Self {
        Self {
            client,
            breaker,
            settings,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Forward one client request.
    pub async fn handle(&self, request: Request<Body>, request_id: &str) -> Response {
        let start = Instant::now();
        let method = request.method().to_string();

        let inbound = match InboundRequest::from_request(request, self.settings.max_body_bytes).await {
            Ok(inbound) => inbound,
            Err(e) => {
                let status = match e {
                    BodyError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    BodyError::Read(_) => StatusCode::BAD_REQUEST,
                };
                tracing::warn!(request_id = %request_id, error = %e, "Rejecting request body");
                metrics::record_request(&method, status.as_u16(), "none", start);
                return (status, e.to_string()).into_response();
            }
        };

        let candidates = self.breaker.sort_by_priority();
        tracing::info!(
            request_id = %request_id,
            method = %inbound.method,
            path = %inbound.path(),
            candidates = candidates.len(),
            "Request started"
        );

        let mut last: Option<AttemptError> = None;
        let mut attempts = 0u32;
        let mut skipped = 0u32;

        for candidate in candidates {
            if self.settings.max_attempts.is_some_and(|max| attempts >= max) {
                tracing::info!(request_id = %request_id, attempts, "Attempt limit reached");
                break;
            }

            let name = candidate.backend.name.clone();
            let permit = match self.breaker.admit(candidate.id) {
                Admission::Skip(reason) => {
                    skipped += 1;
                    tracing::info!(request_id = %request_id, backend = %name, reason = %reason, "Skipping backend");
                    metrics::record_skip(&name, reason.label());
                    if last.is_none() {
                        last = Some(AttemptError::Skipped { backend: name, reason });
                    }
                    continue;
                }
                Admission::Allow => None,
                Admission::Probe(permit) => {
                    tracing::info!(
                        request_id = %request_id,
                        backend = %name,
                        trial = permit.trial,
                        budget = permit.budget,
                        "Half-open trial request"
                    );
                    Some(permit)
                }
            };

            attempts += 1;
            tracing::info!(
                request_id = %request_id,
                attempt = attempts,
                backend = %name,
                rate_limited = candidate.rate_limited,
                "Trying backend"
            );

            match self.attempt(&inbound, &candidate, permit, request_id).await {
                AttemptOutcome::Respond(response) => {
                    metrics::record_request(&method, response.status().as_u16(), &name, start);
                    return response;
                }
                AttemptOutcome::Retry(error) => {
                    tracing::warn!(
                        request_id = %request_id,
                        attempt = attempts,
                        backend = %name,
                        error = %error,
                        "Attempt failed, failing over"
                    );
                    last = Some(error);
                }
            }
        }

        tracing::error!(
            request_id = %request_id,
            attempted = attempts,
            skipped,
            last_error = %last.as_ref().map(ToString::to_string).unwrap_or_default(),
            "All backends unavailable"
        );
        metrics::record_request(&method, StatusCode::BAD_GATEWAY.as_u16(), "none", start);
        response::gateway_error(last.as_ref())
    }

    /// Send the request to one backend and decide what happens next.
    pub async fn attempt(
        &self,
        inbound: &InboundRequest,
        candidate: &Candidate,
        permit: Option<TrialPermit>,
        request_id: &str,
    ) -> AttemptOutcome {
        let backend = &candidate.backend;
        let id = candidate.id;

        let prepared = match prepare(inbound, backend) {
            Ok(prepared) => prepared,
            Err(error) => return self.fail(candidate, permit, error),
        };
        let PreparedRequest {
            url,
            headers,
            body,
            streaming,
            converts,
        } = prepared;

        tracing::debug!(
            request_id = %request_id,
            backend = %backend.name,
            url = %url,
            streaming,
            converts,
            "Sending upstream request"
        );

        let mut builder = self
            .client
            .request(inbound.method.clone(), url)
            .headers(headers)
            .body(body);
        let deadline = attempt_deadline(streaming, self.settings.timeout);
        if let Some(deadline) = deadline {
            builder = builder.timeout(deadline);
        }

        let upstream = match builder.send().await {
            Ok(upstream) => upstream,
            Err(source) => {
                let error = match deadline {
                    Some(timeout) if source.is_timeout() => AttemptError::Timeout {
                        backend: backend.name.clone(),
                        timeout,
                    },
                    _ => AttemptError::Transport {
                        backend: backend.name.clone(),
                        source,
                    },
                };
                return self.fail(candidate, permit, error);
            }
        };

        let status = upstream.status();
        match classify(status) {
            Disposition::Success => {
                self.breaker.record_success(id);
                if let Some(permit) = permit {
                    permit.settle();
                }
                metrics::record_attempt(&backend.name, "success");
                tracing::info!(request_id = %request_id, backend = %backend.name, status = %status, "Upstream succeeded");
                AttemptOutcome::Respond(
                    self.success_response(upstream, &backend.name, converts, streaming, inbound, request_id)
                        .await,
                )
            }
            Disposition::RateLimited => {
                let retry_after = parse_retry_after(upstream.headers());
                let decoded = compression::read_body(upstream).await;
                let body = snippet(&decoded.bytes, ERROR_BODY_CHARS);
                self.breaker.record_rate_limit(id, retry_after);
                metrics::record_attempt(&backend.name, "rate_limited");
                tracing::warn!(
                    request_id = %request_id,
                    backend = %backend.name,
                    retry_after = ?retry_after,
                    body = %body,
                    "Upstream rate limited"
                );
                drop(permit);
                AttemptOutcome::Retry(AttemptError::RateLimited {
                    backend: backend.name.clone(),
                    retry_after,
                    body,
                })
            }
            Disposition::ServerError => {
                let decoded = compression::read_body(upstream).await;
                let error = AttemptError::Upstream {
                    backend: backend.name.clone(),
                    status,
                    body: snippet(&decoded.bytes, ERROR_BODY_CHARS),
                };
                self.fail(candidate, permit, error)
            }
            Disposition::AuthError => {
                let headers = upstream.headers().clone();
                let decoded = compression::read_body(upstream).await;
                metrics::record_attempt(&backend.name, "auth_error");
                tracing::warn!(
                    request_id = %request_id,
                    backend = %backend.name,
                    status = %status,
                    body = %snippet(&decoded.bytes, ERROR_BODY_CHARS),
                    "Upstream rejected credentials, not retrying"
                );
                let headers = response::client_headers(&headers, decoded.was_encoded);
                AttemptOutcome::Respond(response::build(status, headers, Body::from(decoded.bytes)))
            }
            Disposition::Passthrough => {
                metrics::record_attempt(&backend.name, "passthrough");
                tracing::info!(
                    request_id = %request_id,
                    backend = %backend.name,
                    status = %status,
                    "Returning upstream client error as-is"
                );
                let headers = response::client_headers(upstream.headers(), false);
                AttemptOutcome::Respond(response::build(
                    status,
                    headers,
                    Body::from_stream(upstream.bytes_stream()),
                ))
            }
        }
    }

    /// Response for a 2xx upstream answer, converted when the backend speaks
    /// chat completions.
    async fn success_response(
        &self,
        upstream: reqwest::Response,
        backend: &str,
        converts: bool,
        streaming: bool,
        inbound: &InboundRequest,
        request_id: &str,
    ) -> Response {
        let status = upstream.status();
        let sse = response::is_event_stream(upstream.headers()) || (streaming && !is_json(upstream.headers()));

        if sse {
            let (headers, mode) = if converts {
                let mut headers = response::client_headers(upstream.headers(), true);
                set_stream_headers(&mut headers);
                let model = inbound.model().unwrap_or_default();
                (headers, RelayMode::Translate { model })
            } else {
                (response::client_headers(upstream.headers(), false), RelayMode::Verbatim)
            };
            let body = relay::relay(upstream, mode, request_id.to_string(), backend.to_string());
            return response::build(status, headers, body);
        }

        if !converts {
            let headers = response::client_headers(upstream.headers(), false);
            return response::build(status, headers, Body::from_stream(upstream.bytes_stream()));
        }

        let headers = upstream.headers().clone();
        let decoded = compression::read_body(upstream).await;
        match protocol::convert_response(&decoded.bytes) {
            Ok(converted) => response::json_body(status, &headers, converted),
            Err(e) => {
                tracing::error!(
                    request_id = %request_id,
                    backend = %backend,
                    error = %e,
                    body = %snippet(&decoded.bytes, ERROR_BODY_CHARS),
                    "Response conversion failed"
                );
                response::conversion_failure(backend, &e)
            }
        }
    }

    fn fail(&self, candidate: &Candidate, permit: Option<TrialPermit>, error: AttemptError) -> AttemptOutcome {
        self.breaker.record_failure(candidate.id, error.to_string());
        if let Some(permit) = permit {
            permit.settle();
        }
        metrics::record_attempt(&candidate.backend.name, error.kind());
        AttemptOutcome::Retry(error)
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("json"))
}

fn set_stream_headers(headers: &mut HeaderMap) {
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
}
