//! Call abstraction for Tether.
//!
//! A call is an ephemeral signaling session bound to one channel. Peers are
//! call-scoped identities; the call ceases to exist once its last peer leaves.

use crate::ids::{CallId, ChannelId, PeerId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tether_protocol::now_millis;
use tracing::{debug, warn};

/// Maximum ICE candidates held for one direction before a description arrives.
pub const MAX_PENDING_ICE: usize = 64;

/// Media topology tag for a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Every peer connects to every other peer.
    #[default]
    Mesh,
    /// Peers connect through a selective forwarding unit.
    Sfu,
}

impl Topology {
    /// Parse a topology tag.
    ///
    /// # Errors
    ///
    /// Returns an error message for unknown tags.
    pub fn parse(tag: Option<&str>) -> Result<Self, &'static str> {
        match tag {
            None | Some("mesh") => Ok(Topology::Mesh),
            Some("sfu") => Ok(Topology::Sfu),
            Some(_) => Err("Unknown call topology"),
        }
    }
}

/// A call participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub joined_at: u64,
}

/// Lifecycle of a call or stream session, evaluated after every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Has participants.
    Active,
    /// No participants left; must be removed.
    Empty,
    /// Removed from its registry.
    Removed,
}

/// Serializable view of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub channel_id: ChannelId,
    pub topology: Topology,
    pub created_by: UserId,
    pub created_at: u64,
    pub peers: Vec<Peer>,
}

/// Negotiation state for one direction (from -> to).
#[derive(Debug, Default)]
struct Negotiation {
    described: bool,
    pending_ice: VecDeque<Value>,
}

/// A live call.
#[derive(Debug)]
pub struct Call {
    id: CallId,
    channel_id: ChannelId,
    topology: Topology,
    created_by: UserId,
    created_at: u64,
    peers: HashMap<PeerId, Peer>,
    negotiations: HashMap<(PeerId, PeerId), Negotiation>,
}

impl Call {
    /// Create an empty call.
    #[must_use]
    pub fn new(
        id: impl Into<CallId>,
        channel_id: impl Into<ChannelId>,
        created_by: impl Into<UserId>,
        topology: Topology,
    ) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            topology,
            created_by: created_by.into(),
            created_at: now_millis(),
            peers: HashMap::new(),
            negotiations: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    #[must_use]
    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Add a peer.
    pub fn add_peer(&mut self, peer_id: impl Into<PeerId>, user_id: impl Into<UserId>) -> Peer {
        let peer = Peer {
            peer_id: peer_id.into(),
            user_id: user_id.into(),
            joined_at: now_millis(),
        };
        self.peers.insert(peer.peer_id.clone(), peer.clone());
        debug!(call = %self.id, peer = %peer.peer_id, peers = self.peers.len(), "Peer added");
        peer
    }

    /// Remove a peer and every negotiation it took part in.
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<Peer> {
        let removed = self.peers.remove(peer_id);
        if removed.is_some() {
            self.negotiations
                .retain(|(from, to), _| from != peer_id && to != peer_id);
            debug!(call = %self.id, peer = %peer_id, peers = self.peers.len(), "Peer removed");
        }
        removed
    }

    /// Remove every peer.
    pub fn clear(&mut self) -> Vec<Peer> {
        self.negotiations.clear();
        let mut peers: Vec<Peer> = self.peers.drain().map(|(_, p)| p).collect();
        sort_peers(&mut peers);
        peers
    }

    /// Peers ordered by join time.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        sort_peers(&mut peers);
        peers
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        if self.peers.is_empty() {
            Lifecycle::Empty
        } else {
            Lifecycle::Active
        }
    }

    /// Record that a description (offer or answer) went from `from` to `to`.
    ///
    /// Returns the ICE candidates that were waiting for it, in arrival order.
    pub fn record_description(&mut self, from: &str, to: &str) -> Vec<Value> {
        let negotiation = self
            .negotiations
            .entry((from.to_string(), to.to_string()))
            .or_default();
        negotiation.described = true;
        negotiation.pending_ice.drain(..).collect()
    }

    /// Admit an ICE candidate from `from` to `to`.
    ///
    /// Returns the candidate if it can be delivered now; otherwise it is held
    /// until the matching description is routed.
    pub fn admit_ice(&mut self, from: &str, to: &str, candidate: Value) -> Option<Value> {
        let negotiation = self
            .negotiations
            .entry((from.to_string(), to.to_string()))
            .or_default();
        if negotiation.described {
            return Some(candidate);
        }
        if negotiation.pending_ice.len() >= MAX_PENDING_ICE {
            warn!(call = %self.id, from = %from, to = %to, "Pending ICE queue full, dropping oldest");
            negotiation.pending_ice.pop_front();
        }
        negotiation.pending_ice.push_back(candidate);
        None
    }

    /// Number of ICE candidates held for a direction.
    #[must_use]
    pub fn pending_ice(&self, from: &str, to: &str) -> usize {
        self.negotiations
            .get(&(from.to_string(), to.to_string()))
            .map(|n| n.pending_ice.len())
            .unwrap_or(0)
    }

    /// Serializable snapshot.
    #[must_use]
    pub fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            topology: self.topology,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            peers: self.peers(),
        }
    }
}

fn sort_peers(peers: &mut [Peer]) {
    peers.sort_by(|a, b| {
        a.joined_at
            .cmp(&b.joined_at)
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    });
}
