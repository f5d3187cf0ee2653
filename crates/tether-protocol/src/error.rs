//! Error codes carried by `error` envelopes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed error code sent back to the client that triggered a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed envelope, invalid body, or a request that violates protocol rules.
    BadRequest,
    /// The envelope type requires an authenticated connection.
    AuthRequired,
    /// The caller lacks access to the target resource.
    Forbidden,
    /// The target resource does not exist.
    NotFound,
    /// The request conflicts with current state.
    Conflict,
    /// Unexpected server-side failure.
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Internal => "INTERNAL",
        }
    }

    /// Message used when the caller does not provide one.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::BadRequest => "request is malformed",
            Self::AuthRequired => "authentication required",
            Self::Forbidden => "access denied",
            Self::NotFound => "resource not found",
            Self::Conflict => "request conflicts with current state",
            Self::Internal => "internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serializes_screaming_case() {
        let json = serde_json::to_string(&ErrorCode::AuthRequired).unwrap();
        assert_eq!(json, "\"AUTH_REQUIRED\"");

        let parsed: ErrorCode = serde_json::from_str("\"NOT_FOUND\"").unwrap();
        assert_eq!(parsed, ErrorCode::NotFound);
    }

    #[test]
    fn test_error_code_display_matches_wire() {
        for code in [
            ErrorCode::BadRequest,
            ErrorCode::AuthRequired,
            ErrorCode::Forbidden,
            ErrorCode::NotFound,
            ErrorCode::Conflict,
            ErrorCode::Internal,
        ] {
            let wire = serde_json::to_value(code).unwrap();
            assert_eq!(wire, code.to_string());
        }
    }
}
