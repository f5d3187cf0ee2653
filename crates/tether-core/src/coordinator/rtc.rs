//! `rtc.*` handlers: call lifecycle and signaling.

use super::{Coordinator, Request};
use crate::call::{Peer, Topology};
use crate::error::DomainError;
use crate::signaling::{Seat, SignalKind};
use serde::Deserialize;
use serde_json::{json, Value};
use tether_protocol::codec::{json_size, MAX_SIGNAL_PAYLOAD_SIZE};
use tether_protocol::kinds;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct CallCreate {
    channel_id: String,
    #[serde(default)]
    topology: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallRef {
    call_id: String,
}

#[derive(Debug, Deserialize)]
struct CallLeave {
    #[serde(default)]
    call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Signal {
    call_id: String,
    to_peer: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct StreamPublish {
    call_id: String,
    media: String,
    active: bool,
}

impl Coordinator {
    pub(super) async fn call_create(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: CallCreate = req.body()?;
        let topology = Topology::parse(body.topology.as_deref()).map_err(DomainError::bad_request)?;
        let channel = self.visible_channel(&user, &body.channel_id).await?;

        let outcome = self.signaling.create_call(&channel.channel_id, &user, topology);
        if outcome.created {
            let audience = self.channel_audience(&channel.channel_id).await;
            req.push(
                audience,
                kinds::RTC_CALL_EVENT,
                json!({ "kind": "started", "call": outcome.call }),
            );
        }
        Ok(json!({ "call": outcome.call, "created": outcome.created }))
    }

    pub(super) async fn call_join(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: CallRef = req.body()?;
        let call = self
            .signaling
            .call(&body.call_id)
            .ok_or_else(|| DomainError::not_found(format!("Call not found: {}", body.call_id)))?;
        self.visible_channel(&user, &call.channel_id).await?;

        // Switching calls: the old seat is released and announced before the new peer exists.
        let held = self.seat_of(req.conn);
        let held = match held {
            Some(seat) if seat.call_id != call.call_id => {
                self.vacate_seat(req.conn, &mut req.fanouts).await;
                debug!(connection = %req.conn, from = %seat.call_id, to = %call.call_id, "Call switch");
                None
            }
            other => other,
        };

        let joined = self.signaling.join_call(&call.call_id, &user, held.as_ref())?;
        if !joined.rejoined {
            if let Some(stale) = &held {
                self.peers.remove_if(&stale.peer_id, |_, holder| holder == req.conn);
            }
            let seat = Seat {
                call_id: joined.call.call_id.clone(),
                peer_id: joined.peer.peer_id.clone(),
            };
            let bound = match self.connections.get_mut(req.conn) {
                Some(mut entry) => {
                    entry.seat = Some(seat);
                    true
                }
                None => false,
            };
            if !bound {
                // Connection vanished mid-join; give the seat back.
                self.signaling.leave_call(&joined.call.call_id, &joined.peer.peer_id);
                return Err(DomainError::internal("connection closed during join"));
            }
            self.peers
                .insert(joined.peer.peer_id.clone(), req.conn.clone());

            // An end_call that ran before the peer was registered skipped this seat.
            if !self
                .signaling
                .is_member(&joined.call.call_id, &joined.peer.peer_id)
            {
                self.release_peers(std::slice::from_ref(&joined.peer));
                debug!(connection = %req.conn, call = %joined.call.call_id, "Call ended during join");
                return Err(DomainError::not_found(format!(
                    "Call not found: {}",
                    joined.call.call_id
                )));
            }

            let audience = self.channel_audience(&joined.call.channel_id).await;
            req.push(
                audience,
                kinds::RTC_PEER_EVENT,
                json!({
                    "kind": "joined",
                    "call_id": joined.call.call_id,
                    "peer": joined.peer,
                }),
            );
            info!(
                connection = %req.conn,
                call = %joined.call.call_id,
                peer = %joined.peer.peer_id,
                peers = joined.peers.len(),
                "Joined call"
            );
        }

        Ok(json!({
            "call_id": joined.call.call_id,
            "peer_id": joined.peer.peer_id,
            "peers": joined.peers,
            "rejoined": joined.rejoined,
        }))
    }

    pub(super) fn call_signal(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        req.user()?;
        let kind = SignalKind::from_envelope_kind(&req.envelope.t)
            .ok_or_else(|| DomainError::bad_request("Not a signaling message"))?;
        let body: Signal = req.body()?;
        let size = json_size(&body.payload);
        if size > MAX_SIGNAL_PAYLOAD_SIZE {
            return Err(DomainError::bad_request(format!(
                "Signaling payload too large: {size} bytes (max {MAX_SIGNAL_PAYLOAD_SIZE})"
            )));
        }

        let seat = self
            .seat_of(req.conn)
            .filter(|seat| seat.call_id == body.call_id)
            .ok_or_else(|| DomainError::bad_request("Not a member of this call"))?;

        self.signaling
            .route(kind, &body.call_id, &seat.peer_id, &body.to_peer, body.payload)?;
        let delivered = self.peers.contains_key(&body.to_peer);
        Ok(json!({ "delivered": delivered }))
    }

    pub(super) async fn call_leave(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        req.user()?;
        let body: CallLeave = req.body()?;
        let seat = self
            .seat_of(req.conn)
            .ok_or_else(|| DomainError::bad_request("Not in a call"))?;
        if body.call_id.as_deref().is_some_and(|id| id != seat.call_id) {
            return Err(DomainError::bad_request("Not a member of this call"));
        }

        let outcome = self.vacate_seat(req.conn, &mut req.fanouts).await;
        let ended = outcome.as_ref().is_some_and(|o| o.ended);
        Ok(json!({ "call_id": seat.call_id, "ended": ended }))
    }

    pub(super) async fn call_end(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: CallRef = req.body()?;
        let call = self
            .signaling
            .call(&body.call_id)
            .ok_or_else(|| DomainError::not_found(format!("Call not found: {}", body.call_id)))?;
        self.visible_channel(&user, &call.channel_id).await?;

        let ended = self.signaling.end_call(&call.call_id)?;
        self.release_peers(&ended.peers);
        info!(call = %ended.call_id, user = %user, peers = ended.peers.len(), "Call ended by request");

        let audience = self.channel_audience(&ended.channel_id).await;
        req.push(
            audience,
            kinds::RTC_CALL_END,
            json!({
                "call_id": ended.call_id,
                "channel_id": ended.channel_id,
                "reason": "ended",
                "ended_by": user,
            }),
        );
        Ok(json!({ "call_id": ended.call_id, "peers": ended.peers.len() }))
    }

    pub(super) async fn stream_publish(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let body: StreamPublish = req.body()?;
        if body.media.trim().is_empty() {
            return Err(DomainError::bad_request("Media kind is required"));
        }
        let seat = self
            .seat_of(req.conn)
            .filter(|seat| seat.call_id == body.call_id)
            .ok_or_else(|| DomainError::bad_request("Not a member of this call"))?;
        let call = self
            .signaling
            .call(&seat.call_id)
            .ok_or_else(|| DomainError::not_found(format!("Call not found: {}", seat.call_id)))?;

        let audience = self.channel_audience(&call.channel_id).await;
        req.push(
            audience,
            kinds::RTC_PEER_EVENT,
            json!({
                "kind": "stream",
                "call_id": seat.call_id,
                "peer_id": seat.peer_id,
                "user_id": user,
                "media": body.media,
                "active": body.active,
            }),
        );
        Ok(json!({ "call_id": seat.call_id, "media": body.media, "active": body.active }))
    }

    /// Clear the seats of peers removed by an ended call.
    pub(super) fn release_peers(&self, peers: &[Peer]) {
        for peer in peers {
            let Some((_, conn)) = self.peers.remove(&peer.peer_id) else {
                continue;
            };
            if let Some(mut entry) = self.connections.get_mut(&conn) {
                if entry
                    .seat
                    .as_ref()
                    .is_some_and(|seat| seat.peer_id == peer.peer_id)
                {
                    entry.seat = None;
                }
            }
        }
    }
}
