//! Codec for encoding and validating Tether envelopes.
//!
//! Envelopes travel as JSON text frames. Decoding checks the envelope shape
//! before anything is dispatched, so handlers only ever see well-formed input.

use serde_json::Value;
use thiserror::Error;

use crate::envelope::{Envelope, PROTOCOL_VERSION};
use crate::error::ErrorCode;

/// Default maximum raw envelope size (256 KiB).
pub const MAX_ENVELOPE_SIZE: usize = 256 * 1024;

/// Maximum serialized size of a signaling payload (offer/answer/ICE).
pub const MAX_SIGNAL_PAYLOAD_SIZE: usize = 64 * 1024;

/// Maximum chat message text length in bytes.
pub const MAX_MESSAGE_TEXT_SIZE: usize = 8 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds the configured size.
    #[error("Envelope size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Not valid JSON.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Top-level value is not an object.
    #[error("Envelope must be a JSON object")]
    NotAnObject,

    /// Missing or unsupported version.
    #[error("Unsupported envelope version")]
    Version,

    /// Missing or empty type.
    #[error("Envelope type must be a non-empty string")]
    Type,

    /// Missing or non-string id.
    #[error("Envelope id must be a string")]
    Id,

    /// Missing or non-numeric timestamp.
    #[error("Envelope timestamp must be a number")]
    Timestamp,

    /// Missing or non-object body.
    #[error("Envelope body must be an object")]
    Body,
}

impl ProtocolError {
    /// All decoding failures are the client's fault.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        ErrorCode::BadRequest
    }
}

/// A rejected envelope, with the request id when one could be read.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct Rejected {
    /// Id of the rejected envelope, if it was a string.
    pub reply_to: Option<String>,
    /// Why the envelope was rejected.
    pub reason: ProtocolError,
}

impl Rejected {
    fn new(reply_to: Option<String>, reason: ProtocolError) -> Self {
        Self { reply_to, reason }
    }

    /// Build the error reply for this rejection.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        Envelope::error(
            self.reply_to.clone(),
            self.reason.code(),
            self.reason.to_string(),
        )
    }
}

/// Encode an envelope to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode and validate an envelope using [`MAX_ENVELOPE_SIZE`].
///
/// # Errors
///
/// Returns [`Rejected`] if the text is not a valid envelope.
pub fn decode(raw: &str) -> Result<Envelope, Rejected> {
    decode_with_limit(raw, MAX_ENVELOPE_SIZE)
}

/// Decode and validate an envelope with an explicit size limit.
///
/// # Errors
///
/// Returns [`Rejected`] if the text is too large or not a valid envelope.
pub fn decode_with_limit(raw: &str, max: usize) -> Result<Envelope, Rejected> {
    if raw.len() > max {
        return Err(Rejected::new(
            None,
            ProtocolError::TooLarge {
                size: raw.len(),
                max,
            },
        ));
    }

    let value: Value = serde_json::from_str(raw).map_err(|e| Rejected::new(None, e.into()))?;
    validate(value)
}

/// Validate an already-parsed JSON value as an envelope.
///
/// # Errors
///
/// Returns [`Rejected`] describing the first violated field rule.
pub fn validate(value: Value) -> Result<Envelope, Rejected> {
    let Value::Object(mut map) = value else {
        return Err(Rejected::new(None, ProtocolError::NotAnObject));
    };

    let id = match map.get("id") {
        Some(Value::String(id)) => id.clone(),
        _ => return Err(Rejected::new(None, ProtocolError::Id)),
    };
    let reject = |reason| Err(Rejected::new(Some(id.clone()), reason));

    if map.get("v").and_then(Value::as_u64) != Some(u64::from(PROTOCOL_VERSION)) {
        return reject(ProtocolError::Version);
    }

    let kind = match map.get("t") {
        Some(Value::String(t)) if !t.is_empty() => t.clone(),
        _ => return reject(ProtocolError::Type),
    };

    let ts = match map.get("ts") {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    };
    let Some(ts) = ts else {
        return reject(ProtocolError::Timestamp);
    };

    let body = match map.remove("body") {
        Some(body @ Value::Object(_)) => body,
        _ => return reject(ProtocolError::Body),
    };

    let reply_to = map
        .get("reply_to")
        .and_then(Value::as_str)
        .map(str::to_string);
    let ok = map.get("ok").and_then(Value::as_bool);

    Ok(Envelope {
        v: PROTOCOL_VERSION,
        t: kind,
        id,
        ts,
        reply_to,
        ok,
        body,
    })
}

/// Serialized size of a JSON value, used for payload guards.
#[must_use]
pub fn json_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::kinds;
    use serde_json::json;

    #[test]
    fn test_decode_hello() {
        let raw = r#"{"v":1,"t":"hello","id":"h1","ts":1700000000000,"body":{"resume":{}}}"#;
        let envelope = decode(raw).unwrap();
        assert_eq!(envelope.t, kinds::HELLO);
        assert_eq!(envelope.id, "h1");
        assert_eq!(envelope.ts, 1_700_000_000_000);
        assert!(envelope.body["resume"].is_object());
    }

    #[test]
    fn test_decode_accepts_float_timestamp() {
        let raw = r#"{"v":1,"t":"ping","id":"p","ts":1.5e3,"body":{}}"#;
        assert_eq!(decode(raw).unwrap().ts, 1500);
    }

    #[test]
    fn test_decode_accepts_negative_timestamp() {
        let raw = r#"{"v":1,"t":"ping","id":"p","ts":-5,"body":{}}"#;
        assert_eq!(decode(raw).unwrap().ts, -5);

        let raw = r#"{"v":1,"t":"ping","id":"p","ts":-2.5,"body":{}}"#;
        assert_eq!(decode(raw).unwrap().ts, -2);
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let raw = r#"{"v":2,"t":"hello","id":"h1","ts":1,"body":{}}"#;
        let rejected = decode(raw).unwrap_err();
        assert_eq!(rejected.reply_to.as_deref(), Some("h1"));
        assert!(matches!(rejected.reason, ProtocolError::Version));
    }

    #[test]
    fn test_decode_rejects_bad_fields() {
        let cases = [
            (r#"{"v":1,"t":"","id":"a","ts":1,"body":{}}"#, "type"),
            (r#"{"v":1,"t":"x","id":"a","ts":"1","body":{}}"#, "timestamp"),
            (r#"{"v":1,"t":"x","id":"a","ts":1,"body":[]}"#, "body"),
            (r#"{"v":1,"t":"x","id":"a","ts":1}"#, "body"),
        ];
        for (raw, what) in cases {
            let rejected = decode(raw).unwrap_err();
            assert_eq!(rejected.reply_to.as_deref(), Some("a"), "{what}");
            assert_eq!(rejected.to_envelope().error_code(), Some(ErrorCode::BadRequest));
        }
    }

    #[test]
    fn test_decode_without_string_id_has_no_reply_to() {
        let rejected = decode(r#"{"v":1,"t":"x","id":5,"ts":1,"body":{}}"#).unwrap_err();
        assert!(rejected.reply_to.is_none());
        assert!(matches!(rejected.reason, ProtocolError::Id));

        let rejected = decode("not json").unwrap_err();
        assert!(matches!(rejected.reason, ProtocolError::Json(_)));

        let rejected = decode("[1,2]").unwrap_err();
        assert!(matches!(rejected.reason, ProtocolError::NotAnObject));
    }

    #[test]
    fn test_decode_too_large() {
        let body = "x".repeat(128);
        let raw = format!(r#"{{"v":1,"t":"x","id":"a","ts":1,"body":{{"p":"{body}"}}}}"#);
        match decode_with_limit(&raw, 64) {
            Err(Rejected {
                reason: ProtocolError::TooLarge { max: 64, .. },
                ..
            }) => {}
            other => panic!("Expected TooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_encoded_reply_decodes() {
        let reply = Envelope::reply("r1", kinds::PONG, json!({"ts": 5}));
        let text = encode(&reply).unwrap();
        let decoded = decode(&text).unwrap();
        assert_eq!(decoded.reply_to.as_deref(), Some("r1"));
        assert_eq!(decoded.ok, Some(true));
    }

    #[test]
    fn test_json_size() {
        assert_eq!(json_size(&json!({"a": 1})), 7);
    }
}
