//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files and
//! serialization when the management API persists a change.

use serde::{Deserialize, Serialize};

/// Root configuration for the failover proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Interface to bind (e.g., "0.0.0.0").
    pub host: String,

    /// Listen port.
    pub port: u16,

    /// Upstream backends in priority order.
    pub backends: Vec<BackendConfig>,

    /// Per-attempt timeout and attempt cap.
    pub retry: RetryConfig,

    /// Circuit breaker and rate-limit settings.
    pub failover: FailoverConfig,

    /// Outbound HTTP client settings.
    pub upstream: UpstreamConfig,

    /// Inbound request limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Management API settings.
    pub admin: AdminConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backends: Vec::new(),
            retry: RetryConfig::default(),
            failover: FailoverConfig::default(),
            upstream: UpstreamConfig::default(),
            limits: LimitsConfig::default(),
            observability: ObservabilityConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

pub const DEFAULT_PORT: u16 = 8080;

impl ProxyConfig {
    /// Address string for the proxy listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Replace zero-valued settings with their defaults.
    ///
    /// Config files written by hand often carry `0` for "unset"; the loader
    /// runs this before validation so the rest of the proxy never sees them.
    pub fn normalize(&mut self) {
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        if self.host.trim().is_empty() {
            self.host = ProxyConfig::default().host;
        }
        self.retry.normalize();
        self.failover.normalize();
        if self.limits.max_body_bytes == 0 {
            self.limits.max_body_bytes = LimitsConfig::default().max_body_bytes;
        }
        for backend in &mut self.backends {
            if backend.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
                backend.model = None;
            }
        }
    }

    /// Look up a backend by name.
    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn enabled_backends(&self) -> usize {
        self.backends.iter().filter(|b| b.enabled).count()
    }
}

/// Upstream backend definition.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub name: String,

    /// Base URL, optionally with a path prefix (e.g., "https://host/api").
    pub base_url: String,

    /// Bearer token sent upstream in place of the client's credentials.
    #[serde(default)]
    pub token: String,

    /// Disabled backends are never tried.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Overrides the `model` field of every request sent to this backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Wire protocol spoken by the backend.
    #[serde(default)]
    pub platform: Platform,
}

fn default_enabled() -> bool {
    true
}

/// Wire protocol of an upstream backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum Platform {
    /// Native message API (`/v1/messages`), forwarded verbatim.
    #[default]
    #[serde(rename = "anthropic", alias = "", alias = "native")]
    Anthropic,

    /// Chat-completions API; messages requests are converted both ways.
    #[serde(rename = "openai")]
    OpenAi,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Cap on upstream attempts per request. `None` tries every candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Deadline for a non-streaming attempt, covering send and body read.
    pub timeout_seconds: u64,

    /// TCP/TLS connect timeout for every attempt.
    pub connect_timeout_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            timeout_seconds: 30,
            connect_timeout_seconds: 10,
        }
    }
}

impl RetryConfig {
    fn normalize(&mut self) {
        let defaults = Self::default();
        if self.max_attempts == Some(0) {
            self.max_attempts = None;
        }
        if self.timeout_seconds == 0 {
            self.timeout_seconds = defaults.timeout_seconds;
        }
        if self.connect_timeout_seconds == 0 {
            self.connect_timeout_seconds = defaults.connect_timeout_seconds;
        }
    }
}

/// Failover settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
}

impl FailoverConfig {
    fn normalize(&mut self) {
        let cb = CircuitBreakerConfig::default();
        if self.circuit_breaker.failure_threshold == 0 {
            self.circuit_breaker.failure_threshold = cb.failure_threshold;
        }
        if self.circuit_breaker.open_timeout_seconds == 0 {
            self.circuit_breaker.open_timeout_seconds = cb.open_timeout_seconds;
        }
        if self.circuit_breaker.half_open_requests == 0 {
            self.circuit_breaker.half_open_requests = cb.half_open_requests;
        }
        if self.rate_limit.cooldown_seconds == 0 {
            self.rate_limit.cooldown_seconds = RateLimitConfig::default().cooldown_seconds;
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Seconds an open circuit rejects traffic before admitting trials.
    pub open_timeout_seconds: u64,

    /// Trial attempts admitted once the open window has elapsed.
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout_seconds: 30,
            half_open_requests: 1,
        }
    }
}

/// Rate-limit demotion settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Seconds a backend stays demoted after answering 429.
    pub cooldown_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 60,
        }
    }
}

/// Outbound client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Honor `HTTP_PROXY`/`HTTPS_PROXY` from the environment.
    pub system_proxy: bool,

    /// Idle pooled connections are closed after this many seconds.
    pub pool_idle_timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            system_proxy: true,
            pool_idle_timeout_seconds: 90,
        }
    }
}

/// Inbound request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest request body buffered for replay.
    pub max_body_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 32 * 1024 * 1024, // 32MB
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    pub log_level: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Management API configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token required by the management routes. Unset means open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let raw = r#"{"backends":[{"name":"a","base_url":"http://127.0.0.1:1"}]}"#;
        let config: ProxyConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.retry.timeout_seconds, 30);
        assert_eq!(config.failover.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.failover.circuit_breaker.open_timeout_seconds, 30);
        assert_eq!(config.failover.circuit_breaker.half_open_requests, 1);
        assert_eq!(config.failover.rate_limit.cooldown_seconds, 60);

        let backend = &config.backends[0];
        assert!(backend.enabled);
        assert_eq!(backend.platform, Platform::Anthropic);
        assert!(backend.model.is_none());
    }

    #[test]
    fn zero_values_are_normalized() {
        let raw = r#"{
            "port": 0,
            "backends": [{"name":"a","base_url":"http://x","model":"","platform":""}],
            "retry": {"timeout_seconds": 0, "max_attempts": 0},
            "failover": {
                "circuit_breaker": {"failure_threshold": 0, "open_timeout_seconds": 0, "half_open_requests": 0},
                "rate_limit": {"cooldown_seconds": 0}
            }
        }"#;
        let mut config: ProxyConfig = serde_json::from_str(raw).unwrap();
        config.normalize();

        assert_eq!(config.port, 8080);
        assert_eq!(config.retry.timeout_seconds, 30);
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.failover.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.failover.circuit_breaker.half_open_requests, 1);
        assert_eq!(config.failover.rate_limit.cooldown_seconds, 60);
        assert_eq!(config.backends[0].model, None);
        assert_eq!(config.backends[0].platform, Platform::Anthropic);
    }

    #[test]
    fn platform_names() {
        let openai: Platform = serde_json::from_str(r#""openai""#).unwrap();
        let native: Platform = serde_json::from_str(r#""native""#).unwrap();
        assert_eq!(openai, Platform::OpenAi);
        assert_eq!(native, Platform::Anthropic);
        assert_eq!(serde_json::to_string(&Platform::OpenAi).unwrap(), r#""openai""#);
    }
}
