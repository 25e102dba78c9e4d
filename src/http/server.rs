//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the shared breaker, upstream client and forwarder
//! - Create the Axum router: management API routes, everything else proxied
//! - Wire up middleware (request id, tracing)
//! - Serve until the shutdown broadcast fires

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::Response,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admin;
use crate::config::{ConfigManager, ProxyConfig};
use crate::http::forwarder::{build_client, Forwarder, ForwarderSettings};
use crate::resilience::{BreakerSettings, CircuitBreaker};

pub const X_REQUEST_ID: &str = "x-request-id";

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub forwarder: Forwarder,
    pub breaker: Arc<CircuitBreaker>,
    pub config: Arc<ConfigManager>,
}

/// HTTP server for the proxy.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    /// Build all request-path subsystems from the manager's current config.
    pub fn new(config: Arc<ConfigManager>) -> Result<Self, reqwest::Error> {
        let snapshot = config.snapshot();
        let breaker = Arc::new(CircuitBreaker::new(
            snapshot.backends.clone(),
            BreakerSettings::from(&snapshot.failover),
        ));
        let client = build_client(&snapshot)?;
        let forwarder = Forwarder::new(client, breaker.clone(), ForwarderSettings::from(snapshot.as_ref()));

        let state = AppState {
            forwarder,
            breaker,
            config,
        };
        let router = Self::build_router(state.clone());
        Ok(Self { router, state })
    }

    /// Server over a config that is never persisted.
    pub fn from_config(config: ProxyConfig) -> Result<Self, reqwest::Error> {
        Self::new(Arc::new(ConfigManager::in_memory(config)))
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .merge(admin::router(state.clone()))
            .fallback(proxy_handler)
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve on `listener` until `shutdown` fires, then let in-flight
    /// requests finish.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Anything the management API does not claim is forwarded.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    state.forwarder.handle(request, &request_id).await
}
