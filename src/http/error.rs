//! HTTP transport errors (C2).
//!
//! Mirrors the teacher's smart-constructor idiom: no blanket `From<reqwest::Error>`,
//! so every call site chooses the correct classified variant deliberately.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the HTTP transport.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("network error requesting {url}: {message}")]
    Network { url: String, message: String },

    #[error("request to {url} timed out after {elapsed_s:.1}s")]
    Timeout { url: String, elapsed_s: f64 },

    #[error("HTTP {status} from {url}")]
    Status {
        url: String,
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    #[must_use]
    pub fn network(url: &str, message: impl std::fmt::Display) -> Self {
        Self::Network {
            url: url.to_string(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn timeout(url: &str, elapsed: Duration) -> Self {
        Self::Timeout {
            url: url.to_string(),
            elapsed_s: elapsed.as_secs_f64(),
        }
    }

    #[must_use]
    pub fn status(url: &str, status: u16, retry_after: Option<Duration>) -> Self {
        Self::Status {
            url: url.to_string(),
            status,
            retry_after,
        }
    }

    /// The HTTP status code, when this was a status error.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The `Retry-After` delay, when present on a status error.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_display() {
        let err = HttpError::status("https://example.com/f", 503, None);
        assert!(err.to_string().contains("503"));
        assert_eq!(err.status_code(), Some(503));
    }

    #[test]
    fn test_network_error_display() {
        let err = HttpError::network("https://example.com/f", "connection reset");
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(err.status_code(), None);
    }
}
