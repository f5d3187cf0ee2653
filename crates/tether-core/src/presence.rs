//! Presence tracking for Tether.
//!
//! Presence records which live connections belong to which user, and which
//! channels each connection has joined. It only tracks; access decisions
//! belong to the directory collaborator.

use crate::ids::{ChannelId, ConnectionId, UserId};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use tether_protocol::now_millis;
use tracing::debug;

/// Presence state for a single connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionPresence {
    /// Owning user.
    pub user_id: UserId,
    /// Channels this connection joined.
    pub channels: HashSet<ChannelId>,
    /// When the connection authenticated.
    pub since: u64,
}

/// What was removed when a connection left presence.
#[derive(Debug, Clone)]
pub struct Departure {
    /// Owning user.
    pub user_id: UserId,
    /// Channels the connection had joined.
    pub channels: Vec<ChannelId>,
    /// Whether this was the user's last live connection.
    pub went_offline: bool,
}

/// Presence statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceStats {
    /// Distinct online users.
    pub users: usize,
    /// Tracked connections.
    pub connections: usize,
}

/// Presence tracker.
#[derive(Debug, Default)]
pub struct PresenceService {
    /// user id -> live connection ids.
    users: DashMap<UserId, HashSet<ConnectionId>>,
    /// connection id -> presence state.
    connections: DashMap<ConnectionId, ConnectionPresence>,
}

impl PresenceService {
    /// Create a new presence tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection.
    ///
    /// Returns `true` if the user was offline before.
    pub fn add_connection(&self, user_id: &str, connection_id: &ConnectionId) -> bool {
        let mut set = self.users.entry(user_id.to_string()).or_default();
        let came_online = set.is_empty();
        set.insert(connection_id.clone());
        drop(set);

        self.connections.insert(
            connection_id.clone(),
            ConnectionPresence {
                user_id: user_id.to_string(),
                channels: HashSet::new(),
                since: now_millis(),
            },
        );

        debug!(user = %user_id, connection = %connection_id, "Presence: connection added");
        came_online
    }

    /// Remove a connection, pruning the user's entry when it was the last one.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> Option<Departure> {
        let (_, state) = self.connections.remove(connection_id)?;

        if let Some(mut set) = self.users.get_mut(&state.user_id) {
            set.remove(connection_id);
        }
        let went_offline = self
            .users
            .remove_if(&state.user_id, |_, set| set.is_empty())
            .is_some();

        debug!(
            user = %state.user_id,
            connection = %connection_id,
            went_offline,
            "Presence: connection removed"
        );

        Some(Departure {
            user_id: state.user_id,
            channels: state.channels.into_iter().collect(),
            went_offline,
        })
    }

    /// Track a channel join. Returns `true` if newly joined.
    pub fn join_channel(&self, connection_id: &ConnectionId, channel_id: &str) -> bool {
        self.connections
            .get_mut(connection_id)
            .map(|mut state| state.channels.insert(channel_id.to_string()))
            .unwrap_or(false)
    }

    /// Stop tracking a channel. Returns `true` if it was joined.
    pub fn leave_channel(&self, connection_id: &ConnectionId, channel_id: &str) -> bool {
        self.connections
            .get_mut(connection_id)
            .map(|mut state| state.channels.remove(channel_id))
            .unwrap_or(false)
    }

    /// Drop a deleted channel from every connection.
    pub fn forget_channel(&self, channel_id: &str) {
        for mut state in self.connections.iter_mut() {
            state.channels.remove(channel_id);
        }
    }

    /// Live connections of a user.
    #[must_use]
    pub fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionId> {
        self.users
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Users with at least one live connection.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    /// Channels a connection has joined.
    #[must_use]
    pub fn channels_for(&self, connection_id: &ConnectionId) -> Vec<ChannelId> {
        self.connections
            .get(connection_id)
            .map(|state| state.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check whether a connection joined a channel.
    #[must_use]
    pub fn has_joined(&self, connection_id: &ConnectionId, channel_id: &str) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|state| state.channels.contains(channel_id))
    }

    /// Check if a user is online.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// Presence counts.
    #[must_use]
    pub fn stats(&self) -> PresenceStats {
        PresenceStats {
            users: self.users.len(),
            connections: self.connections.len(),
        }
    }
}
