//! Error types for the Compute Engine backend.

use thiserror::Error;

use crate::auth::AuthError;
use crate::backend::BackendError;

/// Errors raised by the Compute Engine backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GceError {
    /// Raised when no access token can be obtained.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    /// Raised when a request is missing a required field.
    #[error("invalid deploy request: {0}")]
    Validation(String),
    /// Raised when a request cannot be sent or its body cannot be decoded.
    #[error("{endpoint} request failed: {message}")]
    Http {
        /// Endpoint being called.
        endpoint: &'static str,
        /// Transport-level error message.
        message: String,
    },
    /// Raised when the API answers with a non-success status.
    #[error("{endpoint} returned {status}: {message}")]
    Api {
        /// Endpoint being called.
        endpoint: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body or a summary of it.
        message: String,
    },
    /// Raised when a mutating operation does not reach a terminal state
    /// before the wait deadline.
    #[error("timeout waiting for {action} on instance {name}")]
    OperationTimeout {
        /// Action being waited on.
        action: &'static str,
        /// Instance the operation targets.
        name: String,
    },
    /// Raised when the provider reports a completed operation as failed.
    #[error("{action} failed for instance {name}: {message}")]
    OperationFailed {
        /// Action that failed.
        action: &'static str,
        /// Instance the operation targets.
        name: String,
        /// Error detail reported by the provider.
        message: String,
    },
}

impl GceError {
    /// HTTP status carried by an API error, if this is one.
    #[must_use]
    pub const fn api_status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<BackendError> for GceError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}
