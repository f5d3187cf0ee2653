//! Outbound delivery queues.
//!
//! Every socket owns a bounded queue drained by its writer task. Handlers and
//! the relay only ever push into these queues, so a slow client never blocks
//! the loop of the connection that produced the message.

use bytes::Bytes;
use tether_protocol::{codec, Envelope};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default per-connection queue capacity.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// A message ready to be written to a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// JSON text frame.
    Text(String),
    /// Binary media frame.
    Binary(Bytes),
    /// Ask the writer to close the socket.
    Close,
}

impl Outbound {
    /// Encode an envelope into a text frame.
    #[must_use]
    pub fn envelope(envelope: &Envelope) -> Option<Self> {
        match codec::encode(envelope) {
            Ok(text) => Some(Outbound::Text(text)),
            Err(e) => {
                warn!(kind = %envelope.t, error = %e, "Failed to encode envelope");
                None
            }
        }
    }

    /// Size of the frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Outbound::Text(text) => text.len(),
            Outbound::Binary(data) => data.len(),
            Outbound::Close => 0,
        }
    }

    /// Check whether the frame carries no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    /// Create an outbox and the receiver the socket writer drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `false` if the queue is full or the writer is gone.
    pub fn send(&self, frame: Outbound) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound queue closed");
                false
            }
        }
    }

    /// Encode and queue an envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        Outbound::envelope(envelope).is_some_and(|frame| self.send(frame))
    }

    /// Check whether the writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbox_delivers_in_order() {
        let (outbox, mut rx) = Outbox::channel(4);
        assert!(outbox.send(Outbound::Text("a".into())));
        assert!(outbox.send(Outbound::Binary(Bytes::from_static(b"b"))));

        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("a".into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Binary(Bytes::from_static(b"b"))
        );
    }

    #[test]
    fn test_outbox_full_drops() {
        let (outbox, _rx) = Outbox::channel(1);
        assert!(outbox.send(Outbound::Close));
        assert!(!outbox.send(Outbound::Close));
    }

    #[test]
    fn test_outbox_closed() {
        let (outbox, rx) = Outbox::channel(1);
        drop(rx);
        assert!(outbox.is_closed());
        assert!(!outbox.send_envelope(&Envelope::push("x", json!({}))));
    }
}
