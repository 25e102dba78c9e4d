//! HTTP subsystem: the listener-facing server and the upstream forwarding path.
//!
//! # Data Flow
//! ```text
//! client request
//!     → server.rs (router, request id, tracing)
//!     → admin routes, or forwarder.rs for everything else
//!     → request.rs (buffer body, per-backend URL/headers/body)
//!     → reqwest upstream call
//!     → response.rs (headers, errors) / relay.rs (SSE frames)
//!     → compression.rs (gzip/zstd bodies)
//!     → client response
//! ```

pub mod compression;
pub mod error;
pub mod forwarder;
pub mod relay;
pub mod request;
pub mod response;
pub mod server;

pub use error::{AttemptError, BodyError};
pub use forwarder::{AttemptOutcome, Forwarder, ForwarderSettings};
pub use server::{AppState, HttpServer, X_REQUEST_ID};
