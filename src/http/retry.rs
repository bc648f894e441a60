//! Retry classification and backoff schedules (§4.2.1).
//!
//! Unlike the teacher's formula-based exponential backoff, this spec names a
//! literal per-class schedule; the classifier shape (match on status code /
//! error kind, documented table) is kept.

use std::time::Duration;

use super::error::HttpError;

/// Failure class (§4.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureType {
    Network,
    Timeout,
    Server5xx,
    RateLimit429,
    Client4xx,
    Integrity,
    Unknown,
}

impl FailureType {
    /// Classifies an HTTP status code.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimit429,
            400..=499 => Self::Client4xx,
            500..=599 => Self::Server5xx,
            _ => Self::Unknown,
        }
    }

    /// Classifies a transport-level error.
    #[must_use]
    pub fn from_http_error(err: &HttpError) -> Self {
        match err {
            HttpError::Timeout { .. } => Self::Timeout,
            HttpError::Network { .. } => Self::Network,
            HttpError::Status { status, .. } => Self::from_status(*status),
            HttpError::InvalidUrl(_) | HttpError::Io(_) => Self::Unknown,
        }
    }

    /// Literal backoff schedule in seconds, by attempt index (0-based), per §4.2.1.
    #[must_use]
    pub fn backoff_schedule(self) -> &'static [u64] {
        match self {
            Self::Network => &[2, 5, 10, 30],
            Self::Timeout => &[5, 15, 30, 60],
            Self::Server5xx => &[1, 3, 5, 10],
            Self::RateLimit429 => &[60, 120, 300, 600],
            Self::Client4xx => &[],
            Self::Unknown => &[1, 2, 4, 8],
            // Integrity retries are counted separately (max 3, §4.3); no fixed delay schedule.
            Self::Integrity => &[],
        }
    }

    /// Whether this class is retried at all (client 4xx never is, §4.2.1).
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Client4xx)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry(Duration),
    /// Stop retrying; the task is terminal.
    GiveUp,
}

/// Retry policy wrapping the per-class backoff schedules and a global attempt ceiling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
}

/// Default maximum attempts per task (§4.2.1).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Decides whether to retry, given the failure class, 1-based attempt number just made,
    /// and an optional server-declared `Retry-After` delay (honored for `rate_limit_429`).
    #[must_use]
    pub fn decide(
        &self,
        failure: FailureType,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !failure.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        if failure == FailureType::RateLimit429
            && let Some(delay) = retry_after
        {
            return RetryDecision::Retry(delay);
        }

        let schedule = failure.backoff_schedule();
        let idx = (attempt as usize).saturating_sub(1).min(schedule.len().saturating_sub(1));
        match schedule.get(idx) {
            Some(secs) => RetryDecision::Retry(Duration::from_secs(*secs)),
            None => RetryDecision::GiveUp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_codes() {
        assert_eq!(FailureType::from_status(429), FailureType::RateLimit429);
        assert_eq!(FailureType::from_status(404), FailureType::Client4xx);
        assert_eq!(FailureType::from_status(401), FailureType::Client4xx);
        assert_eq!(FailureType::from_status(503), FailureType::Server5xx);
        assert_eq!(FailureType::from_status(200), FailureType::Unknown);
    }

    #[test]
    fn test_client_4xx_never_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(FailureType::Client4xx, 1, None),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_network_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(FailureType::Network, 1, None),
            RetryDecision::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(FailureType::Network, 2, None),
            RetryDecision::Retry(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_rate_limit_honors_retry_after_header() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(FailureType::RateLimit429, 1, Some(Duration::from_secs(2))),
            RetryDecision::Retry(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_rate_limit_falls_back_to_schedule_without_header() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(FailureType::RateLimit429, 1, None),
            RetryDecision::Retry(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_max_attempts_one_gives_up_after_first_retryable_failure() {
        let policy = RetryPolicy::with_max_attempts(1);
        assert_eq!(
            policy.decide(FailureType::Network, 1, None),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_unknown_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(FailureType::Unknown, 3, None),
            RetryDecision::Retry(Duration::from_secs(4))
        );
    }
}
