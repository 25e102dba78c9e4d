//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (JSON/TOML)
//!     → loader.rs (parse & deserialize, normalize zero values)
//!     → validation.rs (semantic checks)
//!     → manager.rs (ArcSwap<ProxyConfig>, shared via Arc)
//!
//! On management toggle:
//!     manager.rs clones the snapshot
//!     → backup + atomic write to disk
//!     → atomic swap of Arc<ProxyConfig>
//!     → circuit breaker told about the enable/disable
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - The in-memory config only changes after the file write succeeded

pub mod loader;
pub mod manager;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use manager::{mask_token, ConfigManager, ManagerError};
pub use schema::{
    AdminConfig, BackendConfig, CircuitBreakerConfig, FailoverConfig, LimitsConfig,
    ObservabilityConfig, Platform, ProxyConfig, RateLimitConfig, RetryConfig, UpstreamConfig,
};
