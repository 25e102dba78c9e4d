//! Timeout discipline for upstream attempts.
//!
//! Non-streaming attempts get one deadline covering connect, send and the
//! whole body read. Streaming attempts get none: a long generation must not be
//! cut off mid-stream. Only the connect timeout on the shared client applies.

use std::time::Duration;

use serde::Deserialize;

#[derive(Deserialize)]
struct StreamFlag {
    #[serde(default)]
    stream: bool,
}

/// `true` when the body is a JSON object with `"stream": true`.
pub fn is_streaming_request(body: &[u8]) -> bool {
    serde_json::from_slice::<StreamFlag>(body)
        .map(|flag| flag.stream)
        .unwrap_or(false)
}

/// Deadline for one attempt, or `None` for streaming attempts.
pub fn attempt_deadline(streaming: bool, timeout: Duration) -> Option<Duration> {
    (!streaming).then_some(timeout)
}
