//! `hub.*` and `channel.*` handlers.
//!
//! The directory decides; these handlers delegate and fan out the result.

use super::{Coordinator, Fanout, Request};
use crate::audience::Audience;
use crate::directory::ChannelPatch;
use crate::error::DomainError;
use crate::ids::ChannelId;
use serde::Deserialize;
use serde_json::{json, Value};
use tether_protocol::{kinds, Envelope};
use tracing::info;

#[derive(Debug, Deserialize)]
struct HubCreate {
    name: String,
}

#[derive(Debug, Deserialize)]
struct HubUpdate {
    hub_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct HubRef {
    hub_id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelCreate {
    hub_id: String,
    name: String,
    #[serde(default)]
    private: bool,
}

#[derive(Debug, Deserialize)]
struct ChannelUpdate {
    channel_id: String,
    #[serde(flatten)]
    patch: ChannelPatch,
}

#[derive(Debug, Deserialize)]
struct ChannelRef {
    channel_id: String,
}

impl Coordinator {
    pub(super) async fn hub_create(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: HubCreate = req.body()?;
        let hub = self.directory.create_hub(&user, &body.name).await?;
        let audience = self.hub_audience(&hub.hub_id).await;
        req.push(audience, kinds::HUB_EVENT, json!({ "kind": "created", "hub": hub }));
        Ok(json!({ "hub": hub }))
    }

    pub(super) async fn hub_update(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: HubUpdate = req.body()?;
        let hub = self.directory.update_hub(&user, &body.hub_id, &body.name).await?;
        let audience = self.hub_audience(&hub.hub_id).await;
        req.push(audience, kinds::HUB_EVENT, json!({ "kind": "updated", "hub": hub }));
        Ok(json!({ "hub": hub }))
    }

    pub(super) async fn hub_delete(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: HubRef = req.body()?;
        if !self.directory.can_view_hub(&user, &body.hub_id).await? {
            return Err(DomainError::forbidden("No access to this hub"));
        }
        // Resolved before deletion: afterwards nobody can see the hub.
        let audience = self.hub_audience(&body.hub_id).await;
        let deleted = self.directory.delete_hub(&user, &body.hub_id).await?;

        for channel_id in &deleted.channel_ids {
            self.retire_channel(channel_id, &audience, &mut req.fanouts);
        }
        info!(hub = %body.hub_id, user = %user, channels = deleted.channel_ids.len(), "Hub deleted");
        req.push(
            audience,
            kinds::HUB_EVENT,
            json!({ "kind": "deleted", "hub_id": body.hub_id }),
        );
        Ok(json!({ "hub_id": body.hub_id, "channel_ids": deleted.channel_ids }))
    }

    pub(super) async fn hub_list(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let hubs = self.directory.list_hubs(&user).await?;
        Ok(json!({ "hubs": hubs }))
    }

    pub(super) async fn hub_join(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: HubRef = req.body()?;
        let hub = self.directory.join_hub(&user, &body.hub_id).await?;
        let audience = self.hub_audience(&hub.hub_id).await;
        req.push(
            audience,
            kinds::HUB_EVENT,
            json!({ "kind": "member_joined", "hub_id": hub.hub_id, "user_id": user }),
        );
        Ok(json!({ "hub": hub }))
    }

    pub(super) async fn hub_leave(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: HubRef = req.body()?;
        // Resolved before leaving so the leaver's other sessions hear it too.
        let audience = self.hub_audience(&body.hub_id).await;
        let hub = self.directory.leave_hub(&user, &body.hub_id).await?;
        self.prune_presence(&user).await;
        req.push(
            audience,
            kinds::HUB_EVENT,
            json!({ "kind": "member_left", "hub_id": hub.hub_id, "user_id": user }),
        );
        Ok(json!({ "hub_id": hub.hub_id }))
    }

    pub(super) async fn channel_create(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: ChannelCreate = req.body()?;
        let channel = self
            .directory
            .create_channel(&user, &body.hub_id, &body.name, body.private)
            .await?;
        // Channel audience: a private channel is announced only to those who can see it.
        let audience = self.channel_audience(&channel.channel_id).await;
        req.push(
            audience,
            kinds::CHANNEL_EVENT,
            json!({ "kind": "created", "channel": channel }),
        );
        Ok(json!({ "channel": channel }))
    }

    pub(super) async fn channel_update(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: ChannelUpdate = req.body()?;
        let before = self.channel_audience(&body.channel_id).await;
        let removed = body.patch.remove_members.clone();
        let channel = self
            .directory
            .update_channel(&user, &body.channel_id, body.patch)
            .await?;
        let after = self.channel_audience(&channel.channel_id).await;

        self.prune_presence_all(&before).await;
        for member in &removed {
            self.prune_presence(member).await;
        }
        req.push(
            before.union(after),
            kinds::CHANNEL_EVENT,
            json!({ "kind": "updated", "channel": channel }),
        );
        Ok(json!({ "channel": channel }))
    }

    pub(super) async fn channel_delete(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: ChannelRef = req.body()?;
        let channel = self.visible_channel(&user, &body.channel_id).await?;
        let audience = self.channel_audience(&channel.channel_id).await;
        self.directory.delete_channel(&user, &channel.channel_id).await?;

        self.retire_channel(&channel.channel_id, &audience, &mut req.fanouts);
        req.push(
            audience,
            kinds::CHANNEL_EVENT,
            json!({
                "kind": "deleted",
                "channel_id": channel.channel_id,
                "hub_id": channel.hub_id,
            }),
        );
        Ok(json!({ "channel_id": channel.channel_id }))
    }

    pub(super) async fn channel_list(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: HubRef = req.body()?;
        let channels = self.directory.list_channels(&user, &body.hub_id).await?;
        Ok(json!({ "channels": channels }))
    }

    pub(super) async fn channel_join(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: ChannelRef = req.body()?;
        let channel = self.visible_channel(&user, &body.channel_id).await?;

        if self.presence.join_channel(req.conn, &channel.channel_id) {
            let audience = self.channel_audience(&channel.channel_id).await;
            req.push(
                audience,
                kinds::CHANNEL_EVENT,
                json!({
                    "kind": "member_joined",
                    "channel_id": channel.channel_id,
                    "user_id": user,
                }),
            );
        }
        let call = self.signaling.call_for_channel(&channel.channel_id);
        Ok(json!({ "channel": channel, "call": call }))
    }

    pub(super) async fn channel_leave(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: ChannelRef = req.body()?;
        let left = self.presence.leave_channel(req.conn, &body.channel_id);
        if left {
            let audience = self.channel_audience(&body.channel_id).await;
            req.push(
                audience,
                kinds::CHANNEL_EVENT,
                json!({
                    "kind": "member_left",
                    "channel_id": body.channel_id,
                    "user_id": user,
                }),
            );
        }
        Ok(json!({ "channel_id": body.channel_id, "left": left }))
    }

    /// Re-check channel tracking for every user in an audience.
    async fn prune_presence_all(&self, audience: &Audience) {
        let mut users: Vec<String> = audience
            .excluding(None)
            .filter_map(|conn| self.user_of(conn))
            .collect();
        users.sort_unstable();
        users.dedup();
        for user in users {
            self.prune_presence(&user).await;
        }
    }

    /// Forget a deleted channel: end its call, drop presence tracking and its
    /// sequence counter.
    fn retire_channel(&self, channel_id: &ChannelId, audience: &Audience, fanouts: &mut Vec<Fanout>) {
        if let Some(call) = self.signaling.call_for_channel(channel_id) {
            if let Ok(ended) = self.signaling.end_call(&call.call_id) {
                self.release_peers(&ended.peers);
                fanouts.push(Fanout {
                    audience: audience.clone(),
                    envelope: Envelope::push(
                        kinds::RTC_CALL_END,
                        json!({
                            "call_id": ended.call_id,
                            "channel_id": channel_id,
                            "reason": "channel_deleted",
                        }),
                    ),
                });
            }
        }
        self.presence.forget_channel(channel_id);
        self.sequences.forget(channel_id);
    }
}
