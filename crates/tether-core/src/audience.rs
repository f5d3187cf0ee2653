//! Broadcast audience resolution.
//!
//! An audience is every live connection whose user can currently see the hub
//! or channel. It is recomputed for each broadcast and never cached.

use crate::directory::Directory;
use crate::error::DomainError;
use crate::ids::ConnectionId;
use crate::presence::PresenceService;

/// Connections entitled to receive a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Audience {
    connections: Vec<ConnectionId>,
}

impl Audience {
    /// Audience of a channel.
    ///
    /// # Errors
    ///
    /// Propagates directory failures, including an unknown channel.
    pub async fn for_channel(
        presence: &PresenceService,
        directory: &dyn Directory,
        channel_id: &str,
    ) -> Result<Self, DomainError> {
        let mut connections = Vec::new();
        for user in presence.online_users() {
            if directory.can_view_channel(&user, channel_id).await? {
                connections.extend(presence.connections_for_user(&user));
            }
        }
        Ok(Self::from_connections(connections))
    }

    /// Audience of a hub.
    ///
    /// # Errors
    ///
    /// Propagates directory failures, including an unknown hub.
    pub async fn for_hub(
        presence: &PresenceService,
        directory: &dyn Directory,
        hub_id: &str,
    ) -> Result<Self, DomainError> {
        let mut connections = Vec::new();
        for user in presence.online_users() {
            if directory.can_view_hub(&user, hub_id).await? {
                connections.extend(presence.connections_for_user(&user));
            }
        }
        Ok(Self::from_connections(connections))
    }

    /// All live connections of one user.
    #[must_use]
    pub fn for_user(presence: &PresenceService, user_id: &str) -> Self {
        Self::from_connections(presence.connections_for_user(user_id))
    }

    #[must_use]
    pub fn from_connections(mut connections: Vec<ConnectionId>) -> Self {
        connections.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        connections.dedup();
        Self { connections }
    }

    /// Merge another audience into this one.
    #[must_use]
    pub fn union(mut self, other: Audience) -> Self {
        self.connections.extend(other.connections);
        Self::from_connections(self.connections)
    }

    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.iter().any(|c| c == connection_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections to deliver to, skipping `origin`.
    pub fn excluding<'a>(
        &'a self,
        origin: Option<&'a ConnectionId>,
    ) -> impl Iterator<Item = &'a ConnectionId> + 'a {
        self.connections
            .iter()
            .filter(move |c| origin != Some(*c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    #[tokio::test]
    async fn test_channel_audience_follows_visibility() {
        let presence = PresenceService::new();
        let directory = MemoryDirectory::new();
        let hub = directory.create_hub("alice", "Home").await.unwrap();
        let general = directory
            .create_channel("alice", &hub.hub_id, "general", false)
            .await
            .unwrap();
        directory.join_hub("bob", &hub.hub_id).await.unwrap();

        let a1 = ConnectionId::new("a1");
        let a2 = ConnectionId::new("a2");
        let b1 = ConnectionId::new("b1");
        let m1 = ConnectionId::new("m1");
        presence.add_connection("alice", &a1);
        presence.add_connection("alice", &a2);
        presence.add_connection("bob", &b1);
        presence.add_connection("mallory", &m1);

        let audience = Audience::for_channel(&presence, &directory, &general.channel_id)
            .await
            .unwrap();
        assert_eq!(audience.len(), 3);
        assert!(audience.contains(&a2));
        assert!(!audience.contains(&m1));

        let delivered: Vec<_> = audience.excluding(Some(&a1)).cloned().collect();
        assert_eq!(delivered, vec![a2.clone(), b1.clone()]);

        // Recomputed on every call: bob leaving the hub drops him immediately.
        directory.leave_hub("bob", &hub.hub_id).await.unwrap();
        let audience = Audience::for_hub(&presence, &directory, &hub.hub_id)
            .await
            .unwrap();
        assert!(!audience.contains(&b1));
    }

    #[test]
    fn test_union_dedups() {
        let a = Audience::from_connections(vec![ConnectionId::new("x"), ConnectionId::new("y")]);
        let b = Audience::from_connections(vec![ConnectionId::new("y"), ConnectionId::new("z")]);
        assert_eq!(a.union(b).len(), 3);
    }
}
