//! Directory collaborator: hubs, channels, membership and visibility.
//!
//! Access control lives here, not in the coordinator. The coordinator asks
//! `can_view_*` at send time to compute audiences.

use crate::error::DomainError;
use crate::ids::{ChannelId, HubId, UserId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tether_protocol::now_millis;
use tracing::debug;
use uuid::Uuid;

/// Maximum hub or channel name length.
pub const MAX_NAME_LENGTH: usize = 100;

/// A hub (server/guild) grouping channels and members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hub {
    pub hub_id: HubId,
    pub name: String,
    pub owner_id: UserId,
    pub created_at: u64,
}

/// A channel inside a hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub hub_id: HubId,
    pub name: String,
    #[serde(default)]
    pub topic: Option<String>,
    /// Private channels are visible to listed members and hub managers only.
    #[serde(default)]
    pub private: bool,
    pub created_at: u64,
}

/// Partial channel update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChannelPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub private: Option<bool>,
    #[serde(default)]
    pub add_members: Vec<UserId>,
    #[serde(default)]
    pub remove_members: Vec<UserId>,
}

/// A deleted hub and the channels removed with it.
#[derive(Debug, Clone)]
pub struct DeletedHub {
    pub hub: Hub,
    pub channel_ids: Vec<ChannelId>,
}

/// Validate a hub or channel name.
///
/// # Errors
///
/// Returns an error if the name is empty, too long, or contains control characters.
pub fn validate_name(name: &str) -> Result<(), DomainError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DomainError::bad_request("Name cannot be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(DomainError::bad_request("Name too long"));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(DomainError::bad_request("Name contains invalid characters"));
    }
    Ok(())
}

/// Directory collaborator interface.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn create_hub(&self, owner: &str, name: &str) -> Result<Hub, DomainError>;
    async fn update_hub(&self, actor: &str, hub_id: &str, name: &str) -> Result<Hub, DomainError>;
    async fn delete_hub(&self, actor: &str, hub_id: &str) -> Result<DeletedHub, DomainError>;
    async fn list_hubs(&self, user: &str) -> Result<Vec<Hub>, DomainError>;
    async fn join_hub(&self, user: &str, hub_id: &str) -> Result<Hub, DomainError>;
    async fn leave_hub(&self, user: &str, hub_id: &str) -> Result<Hub, DomainError>;

    async fn create_channel(
        &self,
        actor: &str,
        hub_id: &str,
        name: &str,
        private: bool,
    ) -> Result<Channel, DomainError>;
    async fn update_channel(
        &self,
        actor: &str,
        channel_id: &str,
        patch: ChannelPatch,
    ) -> Result<Channel, DomainError>;
    async fn delete_channel(&self, actor: &str, channel_id: &str) -> Result<Channel, DomainError>;
    async fn list_channels(&self, user: &str, hub_id: &str) -> Result<Vec<Channel>, DomainError>;
    async fn channel(&self, channel_id: &str) -> Result<Channel, DomainError>;

    /// Whether `user` may see the hub, by role or membership.
    async fn can_view_hub(&self, user: &str, hub_id: &str) -> Result<bool, DomainError>;
    /// Whether `user` may see the channel, by role or membership.
    async fn can_view_channel(&self, user: &str, channel_id: &str) -> Result<bool, DomainError>;
}

/// In-memory directory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    hubs: DashMap<HubId, Hub>,
    hub_members: DashMap<HubId, HashSet<UserId>>,
    channels: DashMap<ChannelId, Channel>,
    channel_members: DashMap<ChannelId, HashSet<UserId>>,
    /// Users with the site-wide admin role.
    admins: DashSet<UserId>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the site-wide admin role.
    pub fn grant_admin(&self, user: &str) {
        self.admins.insert(user.to_string());
    }

    fn hub(&self, hub_id: &str) -> Result<Hub, DomainError> {
        self.hubs
            .get(hub_id)
            .map(|h| h.clone())
            .ok_or_else(|| DomainError::not_found(format!("Hub not found: {hub_id}")))
    }

    fn is_member(&self, user: &str, hub_id: &str) -> bool {
        self.hub_members
            .get(hub_id)
            .is_some_and(|members| members.contains(user))
    }

    /// Owners and admins manage a hub.
    fn can_manage(&self, user: &str, hub: &Hub) -> bool {
        hub.owner_id == user || self.admins.contains(user)
    }

    fn require_manager(&self, user: &str, hub: &Hub) -> Result<(), DomainError> {
        if self.can_manage(user, hub) {
            Ok(())
        } else {
            Err(DomainError::forbidden("Only the hub owner may do this"))
        }
    }

    fn sees_channel(&self, user: &str, channel: &Channel) -> Result<bool, DomainError> {
        let hub = self.hub(&channel.hub_id)?;
        if self.can_manage(user, &hub) {
            return Ok(true);
        }
        if !self.is_member(user, &hub.hub_id) {
            return Ok(false);
        }
        if !channel.private {
            return Ok(true);
        }
        Ok(self
            .channel_members
            .get(&channel.channel_id)
            .is_some_and(|members| members.contains(user)))
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn create_hub(&self, owner: &str, name: &str) -> Result<Hub, DomainError> {
        validate_name(name)?;
        let hub = Hub {
            hub_id: format!("hub_{}", Uuid::new_v4().simple()),
            name: name.trim().to_string(),
            owner_id: owner.to_string(),
            created_at: now_millis(),
        };
        self.hubs.insert(hub.hub_id.clone(), hub.clone());
        self.hub_members
            .entry(hub.hub_id.clone())
            .or_default()
            .insert(owner.to_string());
        debug!(hub = %hub.hub_id, owner = %owner, "Hub created");
        Ok(hub)
    }

    async fn update_hub(&self, actor: &str, hub_id: &str, name: &str) -> Result<Hub, DomainError> {
        validate_name(name)?;
        let hub = self.hub(hub_id)?;
        self.require_manager(actor, &hub)?;
        let mut entry = self
            .hubs
            .get_mut(hub_id)
            .ok_or_else(|| DomainError::not_found(format!("Hub not found: {hub_id}")))?;
        entry.name = name.trim().to_string();
        Ok(entry.clone())
    }

    async fn delete_hub(&self, actor: &str, hub_id: &str) -> Result<DeletedHub, DomainError> {
        let hub = self.hub(hub_id)?;
        self.require_manager(actor, &hub)?;
        self.hubs.remove(hub_id);
        self.hub_members.remove(hub_id);

        let channel_ids: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|c| c.hub_id == hub_id)
            .map(|c| c.channel_id.clone())
            .collect();
        for channel_id in &channel_ids {
            self.channels.remove(channel_id);
            self.channel_members.remove(channel_id);
        }
        debug!(hub = %hub_id, channels = channel_ids.len(), "Hub deleted");
        Ok(DeletedHub { hub, channel_ids })
    }

    async fn list_hubs(&self, user: &str) -> Result<Vec<Hub>, DomainError> {
        let admin = self.admins.contains(user);
        let mut hubs: Vec<Hub> = self
            .hubs
            .iter()
            .filter(|h| admin || self.is_member(user, &h.hub_id))
            .map(|h| h.clone())
            .collect();
        hubs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(hubs)
    }

    async fn join_hub(&self, user: &str, hub_id: &str) -> Result<Hub, DomainError> {
        let hub = self.hub(hub_id)?;
        let inserted = self
            .hub_members
            .entry(hub_id.to_string())
            .or_default()
            .insert(user.to_string());
        if !inserted {
            return Err(DomainError::conflict("Already a member of this hub"));
        }
        Ok(hub)
    }

    async fn leave_hub(&self, user: &str, hub_id: &str) -> Result<Hub, DomainError> {
        let hub = self.hub(hub_id)?;
        if hub.owner_id == user {
            return Err(DomainError::conflict("The owner cannot leave their hub"));
        }
        let removed = self
            .hub_members
            .get_mut(hub_id)
            .is_some_and(|mut members| members.remove(user));
        if !removed {
            return Err(DomainError::not_found("Not a member of this hub"));
        }
        Ok(hub)
    }

    async fn create_channel(
        &self,
        actor: &str,
        hub_id: &str,
        name: &str,
        private: bool,
    ) -> Result<Channel, DomainError> {
        validate_name(name)?;
        let hub = self.hub(hub_id)?;
        self.require_manager(actor, &hub)?;
        let channel = Channel {
            channel_id: format!("ch_{}", Uuid::new_v4().simple()),
            hub_id: hub_id.to_string(),
            name: name.trim().to_string(),
            topic: None,
            private,
            created_at: now_millis(),
        };
        self.channels
            .insert(channel.channel_id.clone(), channel.clone());
        debug!(channel = %channel.channel_id, hub = %hub_id, "Channel created");
        Ok(channel)
    }

    async fn update_channel(
        &self,
        actor: &str,
        channel_id: &str,
        patch: ChannelPatch,
    ) -> Result<Channel, DomainError> {
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        let current = self.channel(channel_id).await?;
        let hub = self.hub(&current.hub_id)?;
        self.require_manager(actor, &hub)?;

        let updated = {
            let mut entry = self
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| DomainError::not_found(format!("Channel not found: {channel_id}")))?;
            if let Some(name) = patch.name {
                entry.name = name.trim().to_string();
            }
            if let Some(topic) = patch.topic {
                entry.topic = Some(topic);
            }
            if let Some(private) = patch.private {
                entry.private = private;
            }
            entry.clone()
        };

        if !patch.add_members.is_empty() || !patch.remove_members.is_empty() {
            let mut members = self.channel_members.entry(channel_id.to_string()).or_default();
            for user in patch.add_members {
                members.insert(user);
            }
            for user in &patch.remove_members {
                members.remove(user);
            }
        }
        Ok(updated)
    }

    async fn delete_channel(&self, actor: &str, channel_id: &str) -> Result<Channel, DomainError> {
        let channel = self.channel(channel_id).await?;
        let hub = self.hub(&channel.hub_id)?;
        self.require_manager(actor, &hub)?;
        self.channels.remove(channel_id);
        self.channel_members.remove(channel_id);
        Ok(channel)
    }

    async fn list_channels(&self, user: &str, hub_id: &str) -> Result<Vec<Channel>, DomainError> {
        if !self.can_view_hub(user, hub_id).await? {
            return Err(DomainError::forbidden("No access to this hub"));
        }
        let candidates: Vec<Channel> = self
            .channels
            .iter()
            .filter(|c| c.hub_id == hub_id)
            .map(|c| c.clone())
            .collect();
        let mut visible = Vec::with_capacity(candidates.len());
        for channel in candidates {
            if self.sees_channel(user, &channel)? {
                visible.push(channel);
            }
        }
        visible.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(visible)
    }

    async fn channel(&self, channel_id: &str) -> Result<Channel, DomainError> {
        self.channels
            .get(channel_id)
            .map(|c| c.clone())
            .ok_or_else(|| DomainError::not_found(format!("Channel not found: {channel_id}")))
    }

    async fn can_view_hub(&self, user: &str, hub_id: &str) -> Result<bool, DomainError> {
        let hub = self.hub(hub_id)?;
        Ok(self.can_manage(user, &hub) || self.is_member(user, hub_id))
    }

    async fn can_view_channel(&self, user: &str, channel_id: &str) -> Result<bool, DomainError> {
        let channel = self.channel(channel_id).await?;
        self.sees_channel(user, &channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("general").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LENGTH + 1)).is_err());
        assert!(validate_name("bad\u{7}").is_err());
    }

    #[tokio::test]
    async fn test_hub_membership_controls_visibility() {
        let dir = MemoryDirectory::new();
        let hub = dir.create_hub("alice", "Home").await.unwrap();
        let general = dir
            .create_channel("alice", &hub.hub_id, "general", false)
            .await
            .unwrap();

        assert!(dir.can_view_channel("alice", &general.channel_id).await.unwrap());
        assert!(!dir.can_view_channel("bob", &general.channel_id).await.unwrap());

        dir.join_hub("bob", &hub.hub_id).await.unwrap();
        assert!(dir.can_view_channel("bob", &general.channel_id).await.unwrap());
        assert!(matches!(
            dir.join_hub("bob", &hub.hub_id).await,
            Err(DomainError::Conflict(_))
        ));

        dir.leave_hub("bob", &hub.hub_id).await.unwrap();
        assert!(!dir.can_view_hub("bob", &hub.hub_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_private_channel_members_and_admin_role() {
        let dir = MemoryDirectory::new();
        let hub = dir.create_hub("alice", "Home").await.unwrap();
        dir.join_hub("bob", &hub.hub_id).await.unwrap();
        dir.join_hub("carol", &hub.hub_id).await.unwrap();
        let secret = dir
            .create_channel("alice", &hub.hub_id, "secret", true)
            .await
            .unwrap();

        assert!(!dir.can_view_channel("bob", &secret.channel_id).await.unwrap());

        let patch = ChannelPatch {
            add_members: vec!["bob".into()],
            ..Default::default()
        };
        dir.update_channel("alice", &secret.channel_id, patch).await.unwrap();
        assert!(dir.can_view_channel("bob", &secret.channel_id).await.unwrap());
        assert!(!dir.can_view_channel("carol", &secret.channel_id).await.unwrap());

        dir.grant_admin("dave");
        assert!(dir.can_view_channel("dave", &secret.channel_id).await.unwrap());

        let listed = dir.list_channels("carol", &hub.hub_id).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_only_managers_mutate() {
        let dir = MemoryDirectory::new();
        let hub = dir.create_hub("alice", "Home").await.unwrap();
        dir.join_hub("bob", &hub.hub_id).await.unwrap();

        assert!(matches!(
            dir.update_hub("bob", &hub.hub_id, "Mine").await,
            Err(DomainError::Forbidden(_))
        ));
        assert!(matches!(
            dir.create_channel("bob", &hub.hub_id, "x", false).await,
            Err(DomainError::Forbidden(_))
        ));
        assert!(matches!(
            dir.leave_hub("alice", &hub.hub_id).await,
            Err(DomainError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_hub_removes_channels() {
        let dir = MemoryDirectory::new();
        let hub = dir.create_hub("alice", "Home").await.unwrap();
        let ch = dir
            .create_channel("alice", &hub.hub_id, "general", false)
            .await
            .unwrap();

        let deleted = dir.delete_hub("alice", &hub.hub_id).await.unwrap();
        assert_eq!(deleted.channel_ids, vec![ch.channel_id.clone()]);
        assert!(matches!(
            dir.channel(&ch.channel_id).await,
            Err(DomainError::NotFound(_))
        ));
        assert!(dir.list_hubs("alice").await.unwrap().is_empty());
    }
}
