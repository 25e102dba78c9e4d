//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarder / breaker / admin produce:
//!     → logging.rs (structured tracing events, request_id + backend fields)
//!     → metrics.rs (counters and histograms)
//!
//! Consumers:
//!     → stdout (tracing-subscriber fmt layer)
//!     → Prometheus scrape endpoint, when enabled
//! ```
//!
//! # Design Decisions
//! - The request id set by the server layer is carried on every event
//! - Metric updates go through the `metrics` facade; with no recorder
//!   installed they are no-ops

pub mod logging;
pub mod metrics;
