//! Per-attempt failure reasons.

use std::time::Duration;

use axum::http::StatusCode;

use crate::protocol::ConversionError;
use crate::resilience::SkipReason;

/// Why one upstream attempt did not produce a response for the client.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("backend {backend} skipped: {reason}")]
    Skipped { backend: String, reason: SkipReason },

    #[error("backend {backend} has an invalid base_url: {source}")]
    InvalidBaseUrl {
        backend: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request conversion for backend {backend} failed: {source}")]
    Conversion {
        backend: String,
        #[source]
        source: ConversionError,
    },

    #[error("backend {backend} timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("backend {backend} unreachable: {source}")]
    Transport {
        backend: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("backend {backend} rate limited (HTTP 429): {body}")]
    RateLimited {
        backend: String,
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("backend {backend} returned HTTP {status}: {body}")]
    Upstream {
        backend: String,
        status: StatusCode,
        body: String,
    },
}

impl AttemptError {
    /// Label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::Skipped { .. } => "skipped",
            AttemptError::InvalidBaseUrl { .. } => "invalid_base_url",
            AttemptError::Conversion { .. } => "conversion",
            AttemptError::Timeout { .. } => "timeout",
            AttemptError::Transport { .. } => "transport",
            AttemptError::RateLimited { .. } => "rate_limited",
            AttemptError::Upstream { .. } => "upstream_error",
        }
    }

    pub fn backend(&self) -> &str {
        match self {
            AttemptError::Skipped { backend, .. }
            | AttemptError::InvalidBaseUrl { backend, .. }
            | AttemptError::Conversion { backend, .. }
            | AttemptError::Timeout { backend, .. }
            | AttemptError::Transport { backend, .. }
            | AttemptError::RateLimited { backend, .. }
            | AttemptError::Upstream { backend, .. } => backend,
        }
    }
}

/// Error from buffering the inbound body.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Read(#[source] axum::Error),
}

/// First `max` characters of a body, for logs and error messages.
pub fn snippet(body: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(body);
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_truncates_on_char_boundary() {
        assert_eq!(snippet(b"short", 10), "short");
        assert_eq!(snippet("héllo wörld".as_bytes(), 4), "héll...");
    }

    #[test]
    fn display_names_the_backend() {
        let err = AttemptError::Upstream {
            backend: "primary".into(),
            status: StatusCode::BAD_GATEWAY,
            body: "upstream down".into(),
        };
        assert_eq!(err.to_string(), "backend primary returned HTTP 502 Bad Gateway: upstream down");
        assert_eq!(err.backend(), "primary");
        assert_eq!(err.kind(), "upstream_error");
    }
}
