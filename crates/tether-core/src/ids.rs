//! Identifier types.
//!
//! Connections get a dedicated newtype because they are minted here; every
//! other id comes from a collaborator or the wire and stays a plain string.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A user identifier issued by the identity collaborator.
pub type UserId = String;
/// A hub identifier.
pub type HubId = String;
/// A channel identifier.
pub type ChannelId = String;
/// A call identifier.
pub type CallId = String;
/// A call-scoped peer identifier.
pub type PeerId = String;

/// Unique identifier for a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Mint a call id.
#[must_use]
pub fn new_call_id() -> CallId {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Mint a peer id.
#[must_use]
pub fn new_peer_id() -> PeerId {
    format!("peer_{}", Uuid::new_v4().simple())
}
