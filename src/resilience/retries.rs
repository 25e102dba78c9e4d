//! Upstream outcome classification.
//!
//! Every attempt ends in exactly one disposition. The forwarder decides from
//! it whether to fail over, what to tell the circuit breaker, and whether the
//! upstream response goes back to the client.
//!
//! | status      | disposition   | fail over | breaker         |
//! |-------------|---------------|-----------|-----------------|
//! | 2xx         | `Success`     | no        | success         |
//! | 429         | `RateLimited` | yes       | rate-limit only |
//! | 5xx         | `ServerError` | yes       | failure         |
//! | 401, 403    | `AuthError`   | no        | nothing         |
//! | other       | `Passthrough` | no        | nothing         |

use std::time::Duration;

use axum::http::{header::RETRY_AFTER, HeaderMap, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    RateLimited,
    ServerError,
    AuthError,
    Passthrough,
}

impl Disposition {
    /// Whether the forwarder moves on to the next candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Disposition::RateLimited | Disposition::ServerError)
    }
}

pub fn classify(status: StatusCode) -> Disposition {
    match status.as_u16() {
        200..=299 => Disposition::Success,
        429 => Disposition::RateLimited,
        500..=599 => Disposition::ServerError,
        401 | 403 => Disposition::AuthError,
        _ => Disposition::Passthrough,
    }
}

/// `Retry-After` in delta-seconds form. HTTP dates are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
