//! Protocol conversion between the native message API and chat completions.
//!
//! # Data Flow
//! ```text
//! client (native) ──► request.rs ──► chat-completions backend
//!                                          │
//!        ┌─────────────────────────────────┴──────────────┐
//!   whole body: response.rs                  SSE: stream.rs (line by line)
//!        └──────────────────────► client (native) ◄───────┘
//! ```
//!
//! Everything here is pure: bytes or lines in, bytes or frames out.

pub mod anthropic;
pub mod models;
pub mod openai;
pub mod request;
pub mod response;
pub mod stream;

pub use request::convert_request;
pub use response::{convert_response, is_native_response};
pub use stream::StreamTranslator;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("request is not a valid message request: {0}")]
    InvalidRequest(#[source] serde_json::Error),

    #[error("response is not a valid chat completion: {0}")]
    InvalidResponse(#[source] serde_json::Error),

    #[error("failed to serialize converted body: {0}")]
    Serialize(#[source] serde_json::Error),
}

pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_tool_use_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}
