//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → circuit_breaker.rs (skip open/disabled backends, reserve half-open trials)
//!     → timeouts.rs (deadline for non-streaming attempts only)
//!     → retries.rs (classify the upstream status)
//!     → circuit_breaker.rs (record success, failure or rate limit)
//! ```
//!
//! # Design Decisions
//! - Per-backend circuit breaker (not global)
//! - Fail over immediately, no backoff between candidates
//! - 429 demotes a backend but never opens its circuit

pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{
    Admission, BackendId, BackendStatus, BreakerSettings, Candidate, CircuitBreaker,
    CircuitState, SkipReason, TrialPermit,
};
pub use retries::{classify, parse_retry_after, Disposition};
pub use timeouts::{attempt_deadline, is_streaming_request};
