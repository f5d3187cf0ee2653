//! Connection registry and transport coordinator.
//!
//! The coordinator owns every live application connection. It validates
//! inbound envelopes, dispatches them to handlers, computes broadcast
//! audiences and delivers signaling events. All shared state is injected at
//! construction; nothing here is global.

mod directory;
mod messages;
mod rtc;
mod session;

use crate::audience::Audience;
use crate::directory::{Channel, Directory};
use crate::error::DomainError;
use crate::identity::IdentityProvider;
use crate::ids::{ConnectionId, PeerId, UserId};
use crate::outbound::{Outbound, Outbox, DEFAULT_OUTBOX_CAPACITY};
use crate::presence::PresenceService;
use crate::signaling::{LeaveOutcome, Seat, SignalEvent, SignalQueue, SignalingService};
use crate::store::{MessageStore, SequenceAllocator};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tether_protocol::codec::{self, MAX_ENVELOPE_SIZE};
use tether_protocol::envelope::allowed_unauthenticated;
use tether_protocol::{kinds, now_millis, Envelope, ErrorCode};
use tracing::{debug, error, info, trace, warn};

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Heartbeat interval advertised in `hello_ack`.
    pub heartbeat_ms: u64,
    /// Largest raw envelope accepted.
    pub max_envelope_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbox_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 25_000,
            max_envelope_size: MAX_ENVELOPE_SIZE,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

/// Registry entry of a live connection.
#[derive(Debug)]
struct ConnectionEntry {
    outbox: Outbox,
    user_id: Option<UserId>,
    token: Option<String>,
    seat: Option<Seat>,
    connected_at: u64,
}

/// A broadcast waiting to be delivered.
#[derive(Debug)]
pub(crate) struct Fanout {
    audience: Audience,
    envelope: Envelope,
}

/// An envelope being handled.
pub(crate) struct Request<'a> {
    conn: &'a ConnectionId,
    envelope: &'a Envelope,
    user: Option<UserId>,
    fanouts: Vec<Fanout>,
}

impl Request<'_> {
    fn user(&self) -> Result<UserId, DomainError> {
        self.user.clone().ok_or(DomainError::AuthRequired)
    }

    fn body<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        Ok(serde_json::from_value(self.envelope.body.clone())?)
    }

    fn push(&mut self, audience: Audience, kind: &str, body: Value) {
        self.fanouts.push(Fanout {
            audience,
            envelope: Envelope::push(kind, body),
        });
    }
}

/// What happened to one inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// Envelope type, `None` when the envelope was rejected before dispatch.
    pub kind: Option<String>,
    /// Error code sent back, if the request failed.
    pub error: Option<ErrorCode>,
}

/// Registry counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub connections: usize,
    pub users: usize,
    pub calls: usize,
    pub peers: usize,
}

/// The connection registry and transport coordinator.
pub struct Coordinator {
    config: CoordinatorConfig,
    identity: Arc<dyn IdentityProvider>,
    directory: Arc<dyn Directory>,
    store: Arc<dyn MessageStore>,
    presence: PresenceService,
    signaling: SignalingService,
    signals: SignalQueue,
    sequences: SequenceAllocator,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Peer id -> connection currently holding it.
    peers: DashMap<PeerId, ConnectionId>,
}

impl Coordinator {
    /// Create a coordinator around its collaborators.
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        identity: Arc<dyn IdentityProvider>,
        directory: Arc<dyn Directory>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let (signaling, signals) = SignalingService::new();
        info!(heartbeat_ms = config.heartbeat_ms, "Creating coordinator");
        Self {
            config,
            identity,
            directory,
            store,
            presence: PresenceService::new(),
            signaling,
            signals,
            sequences: SequenceAllocator::new(),
            connections: DashMap::new(),
            peers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceService {
        &self.presence
    }

    #[must_use]
    pub fn signaling(&self) -> &SignalingService {
        &self.signaling
    }

    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        let signaling = self.signaling.stats();
        CoordinatorStats {
            connections: self.connections.len(),
            users: self.presence.stats().users,
            calls: signaling.calls,
            peers: signaling.peers,
        }
    }

    /// Register a new connection.
    pub fn accept(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId::generate();
        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                outbox,
                user_id: None,
                token: None,
                seat: None,
                connected_at: now_millis(),
            },
        );
        debug!(connection = %id, "Connection accepted");
        id
    }

    /// User a connection is authenticated as.
    #[must_use]
    pub fn user_of(&self, conn: &ConnectionId) -> Option<UserId> {
        self.connections.get(conn).and_then(|e| e.user_id.clone())
    }

    /// Seat a connection holds.
    #[must_use]
    pub fn seat_of(&self, conn: &ConnectionId) -> Option<Seat> {
        self.connections.get(conn).and_then(|e| e.seat.clone())
    }

    /// Handle one raw inbound envelope.
    ///
    /// Never fails: every problem becomes an error reply to this connection.
    pub async fn on_envelope(&self, conn: &ConnectionId, raw: &str) -> Dispatched {
        let envelope = match codec::decode_with_limit(raw, self.config.max_envelope_size) {
            Ok(envelope) => envelope,
            Err(rejected) => {
                debug!(connection = %conn, reason = %rejected.reason, "Envelope rejected");
                self.send_to(conn, &rejected.to_envelope());
                return Dispatched {
                    kind: None,
                    error: Some(rejected.reason.code()),
                };
            }
        };

        let Some(user) = self.connections.get(conn).map(|e| e.user_id.clone()) else {
            warn!(connection = %conn, "Envelope for unknown connection");
            return Dispatched {
                kind: Some(envelope.t),
                error: Some(ErrorCode::NotFound),
            };
        };

        let mut request = Request {
            conn,
            envelope: &envelope,
            user,
            fanouts: Vec::new(),
        };

        let result = if request.user.is_none() && !allowed_unauthenticated(&envelope.t) {
            Err(DomainError::AuthRequired)
        } else {
            match AssertUnwindSafe(self.dispatch(&mut request)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string());
                    Err(DomainError::internal(message))
                }
            }
        };
        let fanouts = std::mem::take(&mut request.fanouts);

        let error = match result {
            Ok(body) => {
                self.send_to(conn, &Envelope::reply(&envelope.id, reply_kind(&envelope.t), body));
                None
            }
            Err(err) => {
                match &err {
                    DomainError::Internal(detail) => {
                        error!(connection = %conn, kind = %envelope.t, error = %detail, "Handler failed");
                    }
                    other => {
                        debug!(connection = %conn, kind = %envelope.t, error = %other, "Request refused");
                    }
                }
                self.send_to(
                    conn,
                    &Envelope::error(Some(envelope.id.clone()), err.code(), err.client_message()),
                );
                Some(err.code())
            }
        };

        // Broadcasts recorded before a failure still happened.
        self.deliver(fanouts, Some(conn));
        self.flush_signals().await;

        Dispatched {
            kind: Some(envelope.t),
            error,
        }
    }

    async fn dispatch(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        trace!(connection = %req.conn, kind = %req.envelope.t, id = %req.envelope.id, "Dispatch");
        match req.envelope.t.as_str() {
            kinds::HELLO => self.hello(req).await,
            kinds::PING => Ok(json!({ "ts": now_millis() })),
            kinds::AUTH_LOGIN => self.login(req).await,
            kinds::AUTH_LOGOUT => self.logout(req).await,
            kinds::AUTH_ME => self.me(req),

            kinds::HUB_CREATE => self.hub_create(req).await,
            kinds::HUB_UPDATE => self.hub_update(req).await,
            kinds::HUB_DELETE => self.hub_delete(req).await,
            kinds::HUB_LIST => self.hub_list(req).await,
            kinds::HUB_JOIN => self.hub_join(req).await,
            kinds::HUB_LEAVE => self.hub_leave(req).await,

            kinds::CHANNEL_CREATE => self.channel_create(req).await,
            kinds::CHANNEL_UPDATE => self.channel_update(req).await,
            kinds::CHANNEL_DELETE => self.channel_delete(req).await,
            kinds::CHANNEL_LIST => self.channel_list(req).await,
            kinds::CHANNEL_JOIN => self.channel_join(req).await,
            kinds::CHANNEL_LEAVE => self.channel_leave(req).await,

            kinds::MSG_SEND => self.msg_send(req).await,
            kinds::MSG_LIST => self.msg_list(req).await,

            kinds::RTC_CALL_CREATE => self.call_create(req).await,
            kinds::RTC_JOIN => self.call_join(req).await,
            kinds::RTC_OFFER | kinds::RTC_ANSWER | kinds::RTC_ICE => self.call_signal(req),
            kinds::RTC_LEAVE => self.call_leave(req).await,
            kinds::RTC_END_CALL => self.call_end(req).await,
            kinds::RTC_STREAM_PUBLISH => self.stream_publish(req).await,

            other => Err(DomainError::bad_request(format!("Unknown message type: {other}"))),
        }
    }

    /// Tear down a connection. Idempotent.
    ///
    /// Order: leave the held call and broadcast, drop presence, drop the
    /// registry entry.
    pub async fn close(&self, conn: &ConnectionId) {
        let mut fanouts = Vec::new();
        self.vacate_seat(conn, &mut fanouts).await;
        self.deliver(fanouts, Some(conn));

        if let Some(departure) = self.presence.remove_connection(conn) {
            debug!(
                connection = %conn,
                user = %departure.user_id,
                went_offline = departure.went_offline,
                "Presence dropped"
            );
        }
        if let Some((_, entry)) = self.connections.remove(conn) {
            let lived_ms = now_millis().saturating_sub(entry.connected_at);
            debug!(connection = %conn, lived_ms, "Connection closed");
        }
        self.flush_signals().await;
    }

    /// Release the seat a connection holds, recording peer-left and call-end
    /// broadcasts.
    async fn vacate_seat(&self, conn: &ConnectionId, fanouts: &mut Vec<Fanout>) -> Option<LeaveOutcome> {
        let (seat, user) = {
            let mut entry = self.connections.get_mut(conn)?;
            let seat = entry.seat.take()?;
            (seat, entry.user_id.clone())
        };
        self.peers.remove_if(&seat.peer_id, |_, holder| holder == conn);

        let outcome = self.signaling.leave_call(&seat.call_id, &seat.peer_id);
        if let Some(channel_id) = outcome.channel_id.as_deref() {
            let audience = self.channel_audience(channel_id).await;
            if outcome.removed {
                fanouts.push(Fanout {
                    audience: audience.clone(),
                    envelope: Envelope::push(
                        kinds::RTC_PEER_EVENT,
                        json!({
                            "kind": "left",
                            "call_id": seat.call_id,
                            "peer_id": seat.peer_id,
                            "user_id": user,
                        }),
                    ),
                });
            }
            if outcome.ended {
                fanouts.push(Fanout {
                    audience,
                    envelope: Envelope::push(
                        kinds::RTC_CALL_END,
                        json!({
                            "call_id": seat.call_id,
                            "channel_id": channel_id,
                            "reason": "empty",
                        }),
                    ),
                });
            }
        }
        Some(outcome)
    }

    /// Audience of a channel; empty when the channel is gone.
    async fn channel_audience(&self, channel_id: &str) -> Audience {
        match Audience::for_channel(&self.presence, self.directory.as_ref(), channel_id).await {
            Ok(audience) => audience,
            Err(err) => {
                debug!(channel = %channel_id, error = %err, "No audience for channel");
                Audience::default()
            }
        }
    }

    /// Audience of a hub; empty when the hub is gone.
    async fn hub_audience(&self, hub_id: &str) -> Audience {
        match Audience::for_hub(&self.presence, self.directory.as_ref(), hub_id).await {
            Ok(audience) => audience,
            Err(err) => {
                debug!(hub = %hub_id, error = %err, "No audience for hub");
                Audience::default()
            }
        }
    }

    /// Load a channel the user may see.
    async fn visible_channel(&self, user: &str, channel_id: &str) -> Result<Channel, DomainError> {
        let channel = self.directory.channel(channel_id).await?;
        if !self.directory.can_view_channel(user, channel_id).await? {
            return Err(DomainError::forbidden("No access to this channel"));
        }
        Ok(channel)
    }

    /// Stop tracking channels a user can no longer see.
    async fn prune_presence(&self, user: &str) {
        for conn in self.presence.connections_for_user(user) {
            for channel_id in self.presence.channels_for(&conn) {
                let visible = self
                    .directory
                    .can_view_channel(user, &channel_id)
                    .await
                    .unwrap_or(false);
                if !visible {
                    self.presence.leave_channel(&conn, &channel_id);
                }
            }
        }
    }

    fn send_to(&self, conn: &ConnectionId, envelope: &Envelope) -> bool {
        let Some(outbox) = self.connections.get(conn).map(|e| e.outbox.clone()) else {
            return false;
        };
        outbox.send_envelope(envelope)
    }

    fn deliver(&self, fanouts: Vec<Fanout>, origin: Option<&ConnectionId>) {
        for fanout in fanouts {
            let Some(frame) = Outbound::envelope(&fanout.envelope) else {
                continue;
            };
            let mut sent = 0usize;
            for target in fanout.audience.excluding(origin) {
                let outbox = self.connections.get(target).map(|e| e.outbox.clone());
                if outbox.is_some_and(|o| o.send(frame.clone())) {
                    sent += 1;
                }
            }
            trace!(kind = %fanout.envelope.t, audience = fanout.audience.len(), sent, "Fanout");
        }
    }

    /// Deliver queued signaling events to whoever holds the target peer now.
    async fn flush_signals(&self) {
        self.signals
            .drain_with(|event| self.deliver_signal(event))
            .await;
    }

    fn deliver_signal(&self, event: SignalEvent) {
        let Some(target) = self.peers.get(&event.to_peer).map(|c| c.clone()) else {
            trace!(call = %event.call_id, peer = %event.to_peer, "Signal target gone, dropped");
            return;
        };
        let envelope = Envelope::push(
            event.kind.envelope_kind(),
            json!({
                "call_id": event.call_id,
                "from_peer": event.from_peer,
                "to_peer": event.to_peer,
                "payload": event.payload,
            }),
        );
        self.send_to(&target, &envelope);
    }
}

fn reply_kind(kind: &str) -> &str {
    match kind {
        kinds::HELLO => kinds::HELLO_ACK,
        kinds::PING => kinds::PONG,
        other => other,
    }
}
