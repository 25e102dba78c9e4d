//! Failover reverse proxy library.
//!
//! Forwards every request to an ordered list of upstream backends, failing
//! over on errors with a per-backend circuit breaker and 429 cooldown, and
//! converting between the native messages protocol and chat completions
//! for backends that speak the latter.

// Core subsystems
pub mod config;
pub mod http;
pub mod protocol;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use config::ConfigManager;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
