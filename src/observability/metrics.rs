//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): client requests by method, status, backend
//! - `proxy_request_duration_seconds` (histogram): end-to-end latency
//! - `proxy_upstream_attempts_total` (counter): attempts by backend, outcome
//! - `proxy_backend_skips_total` (counter): candidates skipped, by reason
//! - `proxy_circuit_transitions_total` (counter): breaker state changes
//!
//! # Design Decisions
//! - Labels are bounded: backend names come from config, never from requests
//! - The Prometheus exporter serves its own listener

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::CircuitState;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, backend: &str, start: Instant) {
    ::metrics::counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "backend" => backend.to_string()
    )
    .increment(1);
    ::metrics::histogram!(
        "proxy_request_duration_seconds",
        "method" => method.to_string(),
        "backend" => backend.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

/// `outcome` is `success`, a status class or an error kind.
pub fn record_attempt(backend: &str, outcome: &str) {
    ::metrics::counter!(
        "proxy_upstream_attempts_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_skip(backend: &str, reason: &'static str) {
    ::metrics::counter!(
        "proxy_backend_skips_total",
        "backend" => backend.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_circuit_transition(backend: &str, to: CircuitState) {
    ::metrics::counter!(
        "proxy_circuit_transitions_total",
        "backend" => backend.to_string(),
        "state" => to.as_str()
    )
    .increment(1);
}
