//! `msg.send` and `msg.list` handlers.

use super::{Coordinator, Request};
use crate::error::DomainError;
use crate::store::{StoredMessage, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use serde::Deserialize;
use serde_json::{json, Value};
use tether_protocol::codec::MAX_MESSAGE_TEXT_SIZE;
use tether_protocol::{kinds, now_millis};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct MsgSend {
    channel_id: String,
    text: String,
    #[serde(default)]
    nonce: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MsgList {
    channel_id: String,
    #[serde(default)]
    before_seq: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

impl Coordinator {
    pub(super) async fn msg_send(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: MsgSend = req.body()?;
        if body.text.trim().is_empty() {
            return Err(DomainError::bad_request("Message text is empty"));
        }
        if body.text.len() > MAX_MESSAGE_TEXT_SIZE {
            return Err(DomainError::bad_request(format!(
                "Message text exceeds {MAX_MESSAGE_TEXT_SIZE} bytes"
            )));
        }
        let channel = self.visible_channel(&user, &body.channel_id).await?;

        // Taken before the write is awaited so concurrent sends never share a seq.
        let seq = self
            .sequences
            .reserve(self.store.as_ref(), &channel.channel_id)
            .await?;
        let message = StoredMessage {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            channel_id: channel.channel_id.clone(),
            seq,
            author_id: user,
            text: body.text,
            nonce: body.nonce,
            created_at: now_millis(),
        };
        let stored = self.store.append(message).await?;
        debug!(channel = %stored.channel_id, seq = stored.seq, "Message sent");

        let audience = self.channel_audience(&stored.channel_id).await;
        req.push(
            audience,
            kinds::MSG_EVENT,
            json!({ "kind": "created", "message": stored }),
        );
        Ok(json!({ "message": stored }))
    }

    pub(super) async fn msg_list(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: MsgList = req.body()?;
        let limit = body.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let channel = self.visible_channel(&user, &body.channel_id).await?;
        let messages = self
            .store
            .list(&channel.channel_id, body.before_seq, limit)
            .await?;
        let has_more = messages.len() == limit && messages.first().is_some_and(|m| m.seq > 1);
        Ok(json!({
            "channel_id": channel.channel_id,
            "messages": messages,
            "has_more": has_more,
        }))
    }
}
