//! Shared HTTP/1.1+HTTP/2 transport (C2, §4.2).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RANGE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::instrument;

use super::error::HttpError;
use crate::user_agent::default_user_agent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 10;

/// Adaptive timeout base and per-MB coefficient (§4.2).
const ADAPTIVE_BASE: Duration = Duration::from_secs(30);
const ADAPTIVE_K_SECS_PER_MB: f64 = 2.0;

/// Size of the rolling window used for `recent_failure_rate` (§4.2).
const FAILURE_WINDOW: usize = 100;

/// Outcome recorded into the rolling failure-rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Success,
    Timeout,
    OtherFailure,
}

/// Shared HTTP client plus the rolling timeout-failure window used for adaptive timeouts.
#[derive(Debug)]
pub struct HttpClient {
    client: Client,
    api_token: Option<String>,
    recent_outcomes: Mutex<VecDeque<DownloadOutcome>>,
}

impl HttpClient {
    /// Builds the shared client. `api_token` is applied as `Authorization: Bearer <token>`
    /// to every request when present (§4.2, §6.1 `api_token`).
    ///
    /// # Errors
    /// Returns an error if the underlying `reqwest` client fails to build.
    pub fn new(api_token: Option<String>) -> Result<Self, HttpError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(default_user_agent())
            .gzip(true)
            .build()
            .map_err(|e| HttpError::network("<client-build>", e))?;

        Ok(Self {
            client,
            api_token,
            recent_outcomes: Mutex::new(VecDeque::with_capacity(FAILURE_WINDOW)),
        })
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.api_token
            && let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}"))
        {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    /// Fetches and decodes a JSON payload (used by the Enumerator for paginated endpoints).
    ///
    /// # Errors
    /// Returns [`HttpError`] on network failure, non-2xx status, or invalid JSON.
    #[instrument(skip(self))]
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HttpError> {
        let response = self
            .client
            .get(url)
            .headers(self.auth_headers())
            .timeout(READ_FIRST_BYTE_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify_send_error(url, &e))?;

        let response = self.check_status(url, response)?;
        response
            .json::<T>()
            .await
            .map_err(|e| HttpError::network(url, e))
    }

    /// Issues a `HEAD` request, primarily to probe `Accept-Ranges` support before a resume.
    ///
    /// # Errors
    /// Returns [`HttpError`] on network failure or non-2xx status.
    #[instrument(skip(self))]
    pub async fn head(&self, url: &str) -> Result<Response, HttpError> {
        let response = self
            .client
            .head(url)
            .headers(self.auth_headers())
            .timeout(READ_FIRST_BYTE_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify_send_error(url, &e))?;
        self.check_status(url, response)
    }

    /// Issues the streaming GET for a file download, optionally resuming via `Range`.
    ///
    /// Returns the raw [`Response`] so the Download Engine can branch on 200 vs. 206 and
    /// stream the body itself (keeping per-file memory at O(chunk size), §5).
    ///
    /// # Errors
    /// Returns [`HttpError`] on network failure, timeout, or non-2xx/206 status.
    #[instrument(skip(self))]
    pub async fn download(
        &self,
        url: &str,
        resume_from: Option<u64>,
        total_timeout: Duration,
    ) -> Result<Response, HttpError> {
        let mut request = self
            .client
            .get(url)
            .headers(self.auth_headers())
            .timeout(total_timeout);

        if let Some(offset) = resume_from {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_send_error(url, &e))?;

        self.check_status(url, response)
    }

    fn check_status(&self, url: &str, response: Response) -> Result<Response, HttpError> {
        let status = response.status();
        if status.is_success() || status == StatusCode::PARTIAL_CONTENT {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(HttpError::status(url, status.as_u16(), retry_after))
    }

    /// Computes the adaptive total timeout for a file of `size_bytes` (§4.2).
    pub fn adaptive_total_timeout(&self, size_bytes: u64) -> Duration {
        let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
        let failure_rate = self.recent_timeout_failure_rate();
        let computed = ADAPTIVE_K_SECS_PER_MB * size_mb * (1.0 + failure_rate);
        ADAPTIVE_BASE.max(Duration::from_secs_f64(computed))
    }

    /// Records a download outcome into the rolling window feeding `recent_failure_rate`.
    pub fn record_outcome(&self, outcome: DownloadOutcome) {
        let Ok(mut window) = self.recent_outcomes.lock() else {
            return;
        };
        if window.len() == FAILURE_WINDOW {
            window.pop_front();
        }
        window.push_back(outcome);
    }

    fn recent_timeout_failure_rate(&self) -> f64 {
        let Ok(window) = self.recent_outcomes.lock() else {
            return 0.0;
        };
        if window.is_empty() {
            return 0.0;
        }
        let timeouts = window
            .iter()
            .filter(|o| matches!(o, DownloadOutcome::Timeout))
            .count();
        timeouts as f64 / window.len() as f64
    }
}

fn classify_send_error(url: &str, err: &reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::timeout(url, Duration::from_secs(0))
    } else {
        HttpError::network(url, err)
    }
}

/// Parses a `Retry-After` header value: either delta-seconds or an RFC 7231 HTTP-date.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let target = httpdate::parse_http_date(value.trim()).ok()?;
    target
        .duration_since(std::time::SystemTime::now())
        .ok()
        .map(|d| d.min(Duration::from_secs(3600)))
}
