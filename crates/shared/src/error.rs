use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidState,
    UnknownDevice,
    SubmissionError,
    ConfirmationError,
    Timeout,
    TransportError,
    Internal,
}

impl ErrorKind {
    /// Whether the failure reached the caller before any ledger transaction
    /// was accepted.
    pub fn is_synchronous(self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidState | ErrorKind::UnknownDevice | ErrorKind::SubmissionError
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorKind,
    pub detail: String,
}

impl ApiError {
    pub fn new(error: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            error,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("ledger rejected submission: {0}")]
    Submission(String),
    #[error("transaction failed on ledger: {0}")]
    Confirmation(String),
    #[error("confirmation not received within {0} seconds")]
    Timeout(u64),
    #[error("ledger unreachable: {0}")]
    Transport(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::InvalidState(_) => ErrorKind::InvalidState,
            RelayError::UnknownDevice(_) => ErrorKind::UnknownDevice,
            RelayError::Submission(_) => ErrorKind::SubmissionError,
            RelayError::Confirmation(_) => ErrorKind::ConfirmationError,
            RelayError::Timeout(_) => ErrorKind::Timeout,
            RelayError::Transport(_) => ErrorKind::TransportError,
            RelayError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(value: RelayError) -> Self {
        Self {
            error: value.kind(),
            detail: value.to_string(),
        }
    }
}

impl From<ApiError> for RelayError {
    fn from(value: ApiError) -> Self {
        let detail = value.detail;
        match value.error {
            ErrorKind::InvalidState => RelayError::InvalidState(detail),
            ErrorKind::UnknownDevice => RelayError::UnknownDevice(detail),
            ErrorKind::SubmissionError => RelayError::Submission(detail),
            ErrorKind::ConfirmationError => RelayError::Confirmation(detail),
            ErrorKind::Timeout => RelayError::Timeout(timeout_secs(&detail)),
            ErrorKind::TransportError => RelayError::Transport(detail),
            ErrorKind::Internal => RelayError::Internal(detail),
        }
    }
}

/// Recovers the bound from a timeout detail such as
/// "confirmation not received within 60 seconds".
fn timeout_secs(detail: &str) -> u64 {
    detail
        .split_whitespace()
        .find_map(|word| word.parse::<u64>().ok())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
