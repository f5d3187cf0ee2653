//! Call signaling for Tether.
//!
//! The signaling service owns every live call and its peers. It never talks
//! to sockets: routed offers, answers and ICE candidates are pushed onto a
//! [`SignalQueue`] which the coordinator drains and delivers.

use crate::call::{Call, CallInfo, Lifecycle, Peer, Topology};
use crate::error::DomainError;
use crate::ids::{new_call_id, new_peer_id, CallId, ChannelId, PeerId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tether_protocol::kinds;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace};

/// Signaling errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    /// Call does not exist.
    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    /// A routed peer is not a current member of the call.
    #[error("Peer {peer} is not a member of call {call}")]
    NotAMember { call: CallId, peer: PeerId },

    /// Sender and receiver are the same peer.
    #[error("Cannot signal to self")]
    SelfSignal,
}

impl From<SignalingError> for DomainError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::CallNotFound(_) => DomainError::NotFound(err.to_string()),
            SignalingError::NotAMember { .. } | SignalingError::SelfSignal => {
                DomainError::BadRequest(err.to_string())
            }
        }
    }
}

/// Kind of a routed signaling payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

impl SignalKind {
    /// Envelope type used when delivering this signal.
    #[must_use]
    pub fn envelope_kind(self) -> &'static str {
        match self {
            SignalKind::Offer => kinds::RTC_OFFER,
            SignalKind::Answer => kinds::RTC_ANSWER,
            SignalKind::Ice => kinds::RTC_ICE,
        }
    }

    /// Map an inbound envelope type to a signal kind.
    #[must_use]
    pub fn from_envelope_kind(kind: &str) -> Option<Self> {
        match kind {
            kinds::RTC_OFFER => Some(SignalKind::Offer),
            kinds::RTC_ANSWER => Some(SignalKind::Answer),
            kinds::RTC_ICE => Some(SignalKind::Ice),
            _ => None,
        }
    }
}

/// A signaling payload ready for delivery to the holder of `to_peer`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    pub kind: SignalKind,
    pub call_id: CallId,
    pub from_peer: PeerId,
    pub to_peer: PeerId,
    pub payload: Value,
}

/// The seat a connection holds: one peer in one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Seat {
    pub call_id: CallId,
    pub peer_id: PeerId,
}

/// Result of `create_call`.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub call: CallInfo,
    /// `false` when an existing call for the channel was returned.
    pub created: bool,
}

/// Result of `leave_call`.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub call_id: CallId,
    /// Whether the peer was a member.
    pub removed: bool,
    pub peer: Option<Peer>,
    /// Channel the call was bound to, when the call was found.
    pub channel_id: Option<ChannelId>,
    pub remaining: Vec<Peer>,
    /// Whether this leave emptied and removed the call.
    pub ended: bool,
}

/// Result of `join_call`.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub call: CallInfo,
    pub peer: Peer,
    /// All current peers, including the joiner.
    pub peers: Vec<Peer>,
    /// `true` when the held seat was returned unchanged.
    pub rejoined: bool,
    /// The call left first because the connection switched calls.
    pub switched_from: Option<LeaveOutcome>,
}

/// Result of `end_call`.
#[derive(Debug, Clone)]
pub struct EndOutcome {
    pub call_id: CallId,
    pub channel_id: ChannelId,
    pub peers: Vec<Peer>,
}

/// Receiving side of the signal queue, drained by the coordinator.
pub struct SignalQueue {
    rx: Mutex<mpsc::UnboundedReceiver<SignalEvent>>,
}

impl SignalQueue {
    /// Drain every queued event, in emission order.
    ///
    /// Concurrent drainers are serialized so delivery order equals emission order.
    pub async fn drain_with<F>(&self, mut deliver: F) -> usize
    where
        F: FnMut(SignalEvent),
    {
        let mut rx = self.rx.lock().await;
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            deliver(event);
            count += 1;
        }
        count
    }
}

/// Signaling statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalingStats {
    pub calls: usize,
    pub peers: usize,
}

/// Owner of call and peer state.
pub struct SignalingService {
    /// Calls indexed by id.
    calls: DashMap<CallId, Call>,
    /// Live call per channel.
    by_channel: DashMap<ChannelId, CallId>,
    /// Outbound signal events.
    events: mpsc::UnboundedSender<SignalEvent>,
}

impl SignalingService {
    /// Create the service and the queue its events are drained from.
    #[must_use]
    pub fn new() -> (Self, SignalQueue) {
        let (events, rx) = mpsc::unbounded_channel();
        let service = Self {
            calls: DashMap::new(),
            by_channel: DashMap::new(),
            events,
        };
        (service, SignalQueue { rx: Mutex::new(rx) })
    }

    /// Create a call for a channel, or return the live one.
    pub fn create_call(&self, channel_id: &str, creator_id: &str, topology: Topology) -> CreateOutcome {
        // Lock order: by_channel, then calls.
        match self.by_channel.entry(channel_id.to_string()) {
            Entry::Occupied(mut slot) => {
                if let Some(call) = self.calls.get(slot.get()) {
                    return CreateOutcome {
                        call: call.info(),
                        created: false,
                    };
                }
                let call = self.insert_call(channel_id, creator_id, topology);
                slot.insert(call.call_id.clone());
                CreateOutcome { call, created: true }
            }
            Entry::Vacant(slot) => {
                let call = self.insert_call(channel_id, creator_id, topology);
                slot.insert(call.call_id.clone());
                CreateOutcome { call, created: true }
            }
        }
    }

    fn insert_call(&self, channel_id: &str, creator_id: &str, topology: Topology) -> CallInfo {
        let call = Call::new(new_call_id(), channel_id, creator_id, topology);
        let info = call.info();
        self.calls.insert(info.call_id.clone(), call);
        info!(call = %info.call_id, channel = %channel_id, "Call created");
        info
    }

    /// Join a call.
    ///
    /// If `held` is a seat in this call, the same peer is returned. If it is a
    /// seat in another call, that call is left first.
    ///
    /// # Errors
    ///
    /// Returns an error if the call does not exist.
    pub fn join_call(
        &self,
        call_id: &str,
        user_id: &str,
        held: Option<&Seat>,
    ) -> Result<JoinOutcome, SignalingError> {
        if let Some(seat) = held.filter(|seat| seat.call_id == call_id) {
            let call = self
                .calls
                .get(call_id)
                .ok_or_else(|| SignalingError::CallNotFound(call_id.to_string()))?;
            if let Some(peer) = call.peer(&seat.peer_id) {
                debug!(call = %call_id, peer = %seat.peer_id, "Rejoin of held seat");
                return Ok(JoinOutcome {
                    peer: peer.clone(),
                    peers: call.peers(),
                    call: call.info(),
                    rejoined: true,
                    switched_from: None,
                });
            }
        }

        if !self.calls.contains_key(call_id) {
            return Err(SignalingError::CallNotFound(call_id.to_string()));
        }

        let switched_from = held
            .filter(|seat| seat.call_id != call_id)
            .map(|seat| self.leave_call(&seat.call_id, &seat.peer_id));

        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| SignalingError::CallNotFound(call_id.to_string()))?;
        let peer = call.add_peer(new_peer_id(), user_id);

        Ok(JoinOutcome {
            peers: call.peers(),
            call: call.info(),
            peer,
            rejoined: false,
            switched_from,
        })
    }

    /// Leave a call.
    pub fn leave_call(&self, call_id: &str, peer_id: &str) -> LeaveOutcome {
        let mut outcome = LeaveOutcome {
            call_id: call_id.to_string(),
            removed: false,
            peer: None,
            channel_id: None,
            remaining: Vec::new(),
            ended: false,
        };

        let Some(mut call) = self.calls.get_mut(call_id) else {
            return outcome;
        };
        outcome.channel_id = Some(call.channel_id().to_string());
        outcome.peer = call.remove_peer(peer_id);
        outcome.removed = outcome.peer.is_some();
        outcome.remaining = call.peers();
        let lifecycle = call.lifecycle();
        drop(call);

        if lifecycle == Lifecycle::Empty {
            outcome.ended = self.settle(call_id) == Lifecycle::Removed;
        }

        debug!(
            call = %call_id,
            peer = %peer_id,
            removed = outcome.removed,
            ended = outcome.ended,
            "Leave"
        );
        outcome
    }

    /// Remove a call if it is empty.
    fn settle(&self, call_id: &str) -> Lifecycle {
        let Some((_, call)) = self
            .calls
            .remove_if(call_id, |_, call| call.lifecycle() == Lifecycle::Empty)
        else {
            return if self.calls.contains_key(call_id) {
                Lifecycle::Active
            } else {
                Lifecycle::Removed
            };
        };
        self.by_channel
            .remove_if(call.channel_id(), |_, id| id == call_id);
        info!(call = %call_id, channel = %call.channel_id(), "Call removed");
        Lifecycle::Removed
    }

    /// Clear a call unconditionally.
    ///
    /// # Errors
    ///
    /// Returns an error if the call does not exist.
    pub fn end_call(&self, call_id: &str) -> Result<EndOutcome, SignalingError> {
        let (_, mut call) = self
            .calls
            .remove(call_id)
            .ok_or_else(|| SignalingError::CallNotFound(call_id.to_string()))?;
        self.by_channel
            .remove_if(call.channel_id(), |_, id| id == call_id);
        let peers = call.clear();
        info!(call = %call_id, peers = peers.len(), "Call ended");

        Ok(EndOutcome {
            call_id: call_id.to_string(),
            channel_id: call.channel_id().to_string(),
            peers,
        })
    }

    /// Route an offer.
    ///
    /// # Errors
    ///
    /// Returns an error unless both peers are current members of the call.
    pub fn route_offer(&self, call_id: &str, from: &str, to: &str, payload: Value) -> Result<(), SignalingError> {
        self.route(SignalKind::Offer, call_id, from, to, payload)
    }

    /// Route an answer.
    ///
    /// # Errors
    ///
    /// Returns an error unless both peers are current members of the call.
    pub fn route_answer(&self, call_id: &str, from: &str, to: &str, payload: Value) -> Result<(), SignalingError> {
        self.route(SignalKind::Answer, call_id, from, to, payload)
    }

    /// Route an ICE candidate. Candidates sent before the sender's
    /// description to the same peer are held and flushed after it.
    ///
    /// # Errors
    ///
    /// Returns an error unless both peers are current members of the call.
    pub fn route_ice(&self, call_id: &str, from: &str, to: &str, payload: Value) -> Result<(), SignalingError> {
        self.route(SignalKind::Ice, call_id, from, to, payload)
    }

    /// Route any signal kind.
    ///
    /// # Errors
    ///
    /// Returns an error unless both peers are current members of the call.
    pub fn route(
        &self,
        kind: SignalKind,
        call_id: &str,
        from: &str,
        to: &str,
        payload: Value,
    ) -> Result<(), SignalingError> {
        if from == to {
            return Err(SignalingError::SelfSignal);
        }
        let mut call = self.calls.get_mut(call_id).ok_or_else(|| SignalingError::NotAMember {
            call: call_id.to_string(),
            peer: from.to_string(),
        })?;
        for peer in [from, to] {
            if !call.has_peer(peer) {
                return Err(SignalingError::NotAMember {
                    call: call_id.to_string(),
                    peer: peer.to_string(),
                });
            }
        }

        // Emit while the call entry is locked so queue order matches mutation order.
        match kind {
            SignalKind::Offer | SignalKind::Answer => {
                let flushed = call.record_description(from, to);
                self.emit(kind, call_id, from, to, payload);
                for candidate in flushed {
                    self.emit(SignalKind::Ice, call_id, from, to, candidate);
                }
            }
            SignalKind::Ice => {
                if let Some(candidate) = call.admit_ice(from, to, payload) {
                    self.emit(kind, call_id, from, to, candidate);
                } else {
                    trace!(call = %call_id, from = %from, to = %to, "ICE held until description");
                }
            }
        }
        Ok(())
    }

    fn emit(&self, kind: SignalKind, call_id: &str, from: &str, to: &str, payload: Value) {
        let event = SignalEvent {
            kind,
            call_id: call_id.to_string(),
            from_peer: from.to_string(),
            to_peer: to.to_string(),
            payload,
        };
        // The queue lives as long as the coordinator that owns both halves.
        let _ = self.events.send(event);
    }

    /// Snapshot of a call.
    #[must_use]
    pub fn call(&self, call_id: &str) -> Option<CallInfo> {
        self.calls.get(call_id).map(|call| call.info())
    }

    /// Live call bound to a channel.
    #[must_use]
    pub fn call_for_channel(&self, channel_id: &str) -> Option<CallInfo> {
        let call_id = self.by_channel.get(channel_id)?.clone();
        self.call(&call_id)
    }

    /// Check whether a peer is a current member of a call.
    #[must_use]
    pub fn is_member(&self, call_id: &str, peer_id: &str) -> bool {
        self.calls
            .get(call_id)
            .is_some_and(|call| call.has_peer(peer_id))
    }

    /// Call and peer counts.
    #[must_use]
    pub fn stats(&self) -> SignalingStats {
        SignalingStats {
            calls: self.calls.len(),
            peers: self.calls.iter().map(|c| c.peer_count()).sum(),
        }
    }
}
