//! Envelope type for the Tether protocol.
//!
//! Every message exchanged on the application socket is an envelope:
//! `{v, t, id, ts, body, reply_to?, ok?}`. Replies carry `reply_to` set to
//! the id of the request that triggered them.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// The only envelope version this server speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope type names.
pub mod kinds {
    pub const HELLO: &str = "hello";
    pub const HELLO_ACK: &str = "hello_ack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";

    pub const AUTH_LOGIN: &str = "auth.login";
    pub const AUTH_LOGOUT: &str = "auth.logout";
    pub const AUTH_ME: &str = "auth.me";

    pub const HUB_CREATE: &str = "hub.create";
    pub const HUB_UPDATE: &str = "hub.update";
    pub const HUB_DELETE: &str = "hub.delete";
    pub const HUB_LIST: &str = "hub.list";
    pub const HUB_JOIN: &str = "hub.join";
    pub const HUB_LEAVE: &str = "hub.leave";
    pub const HUB_EVENT: &str = "hub.event";

    pub const CHANNEL_CREATE: &str = "channel.create";
    pub const CHANNEL_UPDATE: &str = "channel.update";
    pub const CHANNEL_DELETE: &str = "channel.delete";
    pub const CHANNEL_LIST: &str = "channel.list";
    pub const CHANNEL_JOIN: &str = "channel.join";
    pub const CHANNEL_LEAVE: &str = "channel.leave";
    pub const CHANNEL_EVENT: &str = "channel.event";

    pub const MSG_SEND: &str = "msg.send";
    pub const MSG_LIST: &str = "msg.list";
    pub const MSG_EVENT: &str = "msg.event";

    pub const RTC_CALL_CREATE: &str = "rtc.call_create";
    pub const RTC_JOIN: &str = "rtc.join";
    pub const RTC_OFFER: &str = "rtc.offer";
    pub const RTC_ANSWER: &str = "rtc.answer";
    pub const RTC_ICE: &str = "rtc.ice";
    pub const RTC_LEAVE: &str = "rtc.leave";
    pub const RTC_END_CALL: &str = "rtc.end_call";
    pub const RTC_STREAM_PUBLISH: &str = "rtc.stream_publish";
    pub const RTC_PEER_EVENT: &str = "rtc.peer_event";
    pub const RTC_CALL_EVENT: &str = "rtc.call_event";
    pub const RTC_CALL_END: &str = "rtc.call_end";
}

/// Envelope types a connection may send before it is authenticated.
pub const UNAUTHENTICATED_KINDS: &[&str] = &[kinds::HELLO, kinds::PING, kinds::AUTH_LOGIN];

/// Check whether an envelope type is allowed before authentication.
#[must_use]
pub fn allowed_unauthenticated(kind: &str) -> bool {
    UNAUTHENTICATED_KINDS.contains(&kind)
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate an id for a server-originated envelope.
#[must_use]
pub fn generate_envelope_id() -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("s{:x}-{:x}", now_millis(), counter)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version, always [`PROTOCOL_VERSION`].
    pub v: u8,
    /// Message type, e.g. `rtc.join`.
    pub t: String,
    /// Sender-chosen message id.
    pub id: String,
    /// Sender timestamp in milliseconds. Any JSON number is accepted inbound.
    pub ts: i64,
    /// Id of the request this envelope answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Outcome flag on replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Type-specific payload, always a JSON object.
    pub body: Value,
}

impl Envelope {
    /// Create a client request envelope.
    #[must_use]
    pub fn request(kind: impl Into<String>, id: impl Into<String>, body: Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            t: kind.into(),
            id: id.into(),
            ts: i64::try_from(now_millis()).unwrap_or(i64::MAX),
            reply_to: None,
            ok: None,
            body,
        }
    }

    /// Create a server-pushed envelope that does not answer any request.
    #[must_use]
    pub fn push(kind: impl Into<String>, body: Value) -> Self {
        Self::request(kind, generate_envelope_id(), body)
    }

    /// Create a successful reply to `request_id`.
    #[must_use]
    pub fn reply(request_id: impl Into<String>, kind: impl Into<String>, body: Value) -> Self {
        let mut envelope = Self::push(kind, body);
        envelope.reply_to = Some(request_id.into());
        envelope.ok = Some(true);
        envelope
    }

    /// Create an error reply.
    ///
    /// `request_id` is `None` only when the triggering envelope had no readable id.
    #[must_use]
    pub fn error(request_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        let mut envelope = Self::push(
            kinds::ERROR,
            json!({ "code": code, "message": message.into() }),
        );
        envelope.reply_to = request_id;
        envelope.ok = Some(false);
        envelope
    }

    /// Borrow the body as a JSON object.
    #[must_use]
    pub fn body_object(&self) -> Option<&Map<String, Value>> {
        self.body.as_object()
    }

    /// Read a string field from the body.
    #[must_use]
    pub fn body_str(&self, field: &str) -> Option<&str> {
        self.body.get(field).and_then(Value::as_str)
    }

    /// Error code carried by an `error` envelope.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.t != kinds::ERROR {
            return None;
        }
        self.body
            .get("code")
            .and_then(|code| serde_json::from_value(code.clone()).ok())
    }

    /// Check whether this envelope is a reply.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_carries_request_id() {
        let reply = Envelope::reply("h1", kinds::HELLO_ACK, json!({}));
        assert_eq!(reply.reply_to.as_deref(), Some("h1"));
        assert_eq!(reply.ok, Some(true));
        assert_eq!(reply.v, PROTOCOL_VERSION);
        assert!(reply.is_reply());
    }

    #[test]
    fn test_error_envelope() {
        let err = Envelope::error(Some("r7".into()), ErrorCode::Forbidden, "no access");
        assert_eq!(err.t, kinds::ERROR);
        assert_eq!(err.ok, Some(false));
        assert_eq!(err.error_code(), Some(ErrorCode::Forbidden));
        assert_eq!(err.body["message"], "no access");
    }

    #[test]
    fn test_push_has_no_reply_fields() {
        let push = Envelope::push(kinds::RTC_CALL_END, json!({"call_id": "c"}));
        let json = serde_json::to_value(&push).unwrap();
        assert!(json.get("reply_to").is_none());
        assert!(json.get("ok").is_none());
        assert_eq!(push.body_str("call_id"), Some("c"));
    }

    #[test]
    fn test_unauthenticated_kinds() {
        assert!(allowed_unauthenticated(kinds::HELLO));
        assert!(allowed_unauthenticated(kinds::AUTH_LOGIN));
        assert!(!allowed_unauthenticated(kinds::RTC_JOIN));
        assert!(!allowed_unauthenticated(kinds::MSG_SEND));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_envelope_id(), generate_envelope_id());
    }
}
