//! Top-level application error and exit-code mapping (§6.5, §7).

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DbError;
use crate::enumerator::EnumeratorError;
use crate::http::HttpError;
use crate::queue::QueueError;

/// Composed application-level error. Anything that should abort the run (as opposed to
/// failing a single task, which the Scheduler handles internally) surfaces here.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("task store error: {0}")]
    Queue(#[from] QueueError),

    #[error("enumeration error: {0}")]
    Enumeration(#[from] EnumeratorError),

    #[error("transport error: {0}")]
    Http(#[from] HttpError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Final outcome of one run, used to pick the process exit code (§6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task reached a successful terminal state.
    Success,
    /// At least one task failed non-terminally but the run otherwise completed.
    PartialFailure,
    /// The emergency-stop sentinel was observed.
    EmergencyStop,
}

/// Centralizes exit-code selection from the final run outcome (§6.5), mirroring the
/// teacher's practice of computing the process exit code from final stats rather than
/// scattering `std::process::exit` calls through the call graph.
#[must_use]
pub fn exit_code_for(outcome: Result<RunOutcome, &AppError>) -> i32 {
    match outcome {
        Ok(RunOutcome::Success) => 0,
        Ok(RunOutcome::PartialFailure) => 1,
        Ok(RunOutcome::EmergencyStop) => 3,
        Err(_) => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_success_is_zero() {
        assert_eq!(exit_code_for(Ok(RunOutcome::Success)), 0);
    }

    #[test]
    fn test_exit_code_partial_failure_is_one() {
        assert_eq!(exit_code_for(Ok(RunOutcome::PartialFailure)), 1);
    }

    #[test]
    fn test_exit_code_emergency_stop_is_three() {
        assert_eq!(exit_code_for(Ok(RunOutcome::EmergencyStop)), 3);
    }

    #[test]
    fn test_exit_code_error_is_two() {
        let err = AppError::Io(std::io::Error::other("disk full"));
        assert_eq!(exit_code_for(Err(&err)), 2);
    }
}
