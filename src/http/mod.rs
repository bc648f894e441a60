//! HTTP transport: connection-pooled client, retry classification, adaptive timeouts (C2).

mod client;
mod error;
mod retry;

pub use client::{parse_retry_after, DownloadOutcome, HttpClient};
pub use error::HttpError;
pub use retry::{FailureType, RetryDecision, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
