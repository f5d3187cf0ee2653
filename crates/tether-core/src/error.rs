//! Domain errors raised by collaborators and handlers.
//!
//! These are converted once, at the dispatch boundary, into `error` envelopes.

use tether_protocol::ErrorCode;
use thiserror::Error;

/// Errors a handler may return.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid request body or a request that violates protocol rules.
    #[error("{0}")]
    BadRequest(String),

    /// Request needs an authenticated connection.
    #[error("Authentication required")]
    AuthRequired,

    /// Caller lacks access.
    #[error("{0}")]
    Forbidden(String),

    /// Target does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Request conflicts with current state.
    #[error("{0}")]
    Conflict(String),

    /// Unexpected failure, logged server-side.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wire error code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::AuthRequired => ErrorCode::AuthRequired,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to show the client. Internal details stay in the logs.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => ErrorCode::Internal.default_message().to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("Invalid body: {err}"))
    }
}
