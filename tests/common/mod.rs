//! Shared utilities for integration testing.
//!
//! Mock backends are real axum servers on ephemeral ports. Every request they
//! receive is appended to a shared `HitLog` so tests can assert the exact
//! order in which the proxy tried its backends.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    response::Response,
    Router,
};
use tokio::net::TcpListener;

use failover_proxy::config::{BackendConfig, ConfigManager, Platform, ProxyConfig};
use failover_proxy::http::{AppState, HttpServer};
use failover_proxy::lifecycle::Shutdown;

/// One request as seen by a mock backend.
#[derive(Debug, Clone)]
pub struct Hit {
    pub backend: String,
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Hit {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HitLog(Arc<Mutex<Vec<Hit>>>);

impl HitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend names in the order they were hit.
    pub fn order(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|h| h.backend.clone()).collect()
    }

    pub fn count(&self, backend: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|h| h.backend == backend).count()
    }

    pub fn last(&self, backend: &str) -> Option<Hit> {
        self.0.lock().unwrap().iter().rev().find(|h| h.backend == backend).cloned()
    }

    fn push(&self, hit: Hit) -> usize {
        let mut hits = self.0.lock().unwrap();
        let n = hits.iter().filter(|h| h.backend == hit.backend).count();
        hits.push(hit);
        n
    }
}

/// What a mock backend answers.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl MockReply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self::new(status, serde_json::to_vec(&value).unwrap()).header("content-type", "application/json")
    }

    pub fn sse(body: &str) -> Self {
        Self::new(200, body.as_bytes().to_vec()).header("content-type", "text/event-stream")
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = dyn Fn(usize, &Hit) -> MockReply + Send + Sync;

#[derive(Clone)]
struct MockState {
    name: String,
    log: HitLog,
    responder: Arc<Responder>,
}

/// Start a mock backend whose reply is computed per request. The closure gets
/// the zero-based index of this request among the backend's own hits.
pub async fn start_programmable_backend<F>(name: &str, log: &HitLog, f: F) -> SocketAddr
where
    F: Fn(usize, &Hit) -> MockReply + Send + Sync + 'static,
{
    let state = MockState {
        name: name.to_string(),
        log: log.clone(),
        responder: Arc::new(f),
    };
    let app = Router::new().fallback(mock_handler).with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Mock backend that always gives the same answer.
pub async fn start_mock_backend(name: &str, log: &HitLog, reply: MockReply) -> SocketAddr {
    start_programmable_backend(name, log, move |_, _| reply.clone()).await
}

async fn mock_handler(State(state): State<MockState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    let hit = Hit {
        backend: state.name.clone(),
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers: parts.headers,
        body,
    };
    let index = state.log.push(hit.clone());
    let reply = (state.responder)(index, &hit);

    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = StatusCode::from_u16(reply.status).unwrap();
    for (name, value) in reply.headers {
        response.headers_mut().insert(name, value.parse().unwrap());
    }
    response
}

pub fn backend(name: &str, addr: SocketAddr, platform: Platform) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        base_url: format!("http://{addr}"),
        token: format!("sk-{name}-token"),
        enabled: true,
        model: None,
        platform,
    }
}

/// Config for tests: loopback listener, no system proxy.
pub fn proxy_config(backends: Vec<BackendConfig>) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.backends = backends;
    config.upstream.system_proxy = false;
    config
}

/// A running proxy. Dropping it stops the server.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    start_proxy_with(Arc::new(ConfigManager::in_memory(config))).await
}

pub async fn start_proxy_with(manager: Arc<ConfigManager>) -> TestProxy {
    let server = HttpServer::new(manager).unwrap();
    let state = server.state().clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });

    TestProxy { addr, state, shutdown }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub fn messages_body(model: &str, stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "max_tokens": 64,
        "stream": stream,
        "messages": [{"role": "user", "content": "Hello"}]
    })
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}
