//! Control messages for the stream relay sockets.
//!
//! The relay speaks a smaller JSON dialect than the application socket:
//! a flat object tagged by `type`.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};

/// Client → server relay command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayCommand {
    /// Register on a stream.
    Join {
        stream: String,
        role: String,
        client_id: String,
    },
    /// Drop this socket's registration.
    Leave,
    /// Ask for the current stream state.
    State,
}

/// Stream state tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Live,
}

/// Server → client relay notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayNotice {
    /// Registration accepted.
    Joined {
        stream: String,
        role: String,
        client_id: String,
    },
    /// Current stream state.
    State {
        stream: String,
        state: StreamState,
        broadcaster: bool,
        viewers: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        started_at: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ended_at: Option<u64>,
    },
    /// Another broadcaster claimed the stream.
    Takeover { stream: String },
    /// Registration or frame rejected.
    Error { code: ErrorCode, message: String },
}

impl RelayNotice {
    /// Create an error notice.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        RelayNotice::Error {
            code,
            message: message.into(),
        }
    }

    /// Encode the notice as JSON text.
    #[must_use]
    pub fn to_text(&self) -> String {
        // Notices hold only strings, numbers and enums.
        serde_json::to_string(self).unwrap_or_default()
    }
}
