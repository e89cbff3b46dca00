use shared::error::{ApiError, ErrorKind, RelayError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The relay server answered with a structured error body.
    #[error("relay server answered {status}: {detail}", detail = .error.detail)]
    Api { status: u16, error: ApiError },
    /// Rejected locally before anything was sent.
    #[error(transparent)]
    Rejected(#[from] RelayError),
    #[error("relay server unreachable: {0}")]
    Transport(String),
    #[error("unexpected response from relay server: {0}")]
    Decode(String),
    #[error("invalid server url '{0}'")]
    InvalidUrl(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Api { error, .. } => error.error,
            ClientError::Rejected(error) => error.kind(),
            ClientError::Transport(_) => ErrorKind::TransportError,
            ClientError::Decode(_) | ClientError::InvalidUrl(_) => ErrorKind::Internal,
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        match self {
            ClientError::Api { error, .. } => error.clone(),
            ClientError::Rejected(error) => error.clone().into(),
            other => ApiError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            ClientError::Decode(value.to_string())
        } else {
            ClientError::Transport(value.to_string())
        }
    }
}
