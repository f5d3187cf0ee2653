//! One-to-many stream relay.
//!
//! A stream has two planes. The control plane carries JSON commands and state
//! notices; the media plane carries opaque binary frames from one broadcaster
//! to every viewer. Both are keyed by stream name and a client-supplied client
//! id, which is how a media socket is matched with its control socket.

use crate::call::Lifecycle;
use crate::ids::ConnectionId;
use crate::outbound::{Outbound, Outbox};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use tether_protocol::{now_millis, ErrorCode, RelayCommand, RelayNotice, StreamState};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Which relay socket a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    Control,
    Media,
}

impl Plane {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Plane::Control => "control",
            Plane::Media => "media",
        }
    }
}

/// Role of a registration on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Broadcaster,
    Viewer,
}

impl StreamRole {
    /// Parse a wire role.
    ///
    /// # Errors
    ///
    /// Returns an error for anything other than `broadcaster` or `viewer`.
    pub fn parse(role: &str) -> Result<Self, RelayError> {
        match role {
            "broadcaster" => Ok(StreamRole::Broadcaster),
            "viewer" => Ok(StreamRole::Viewer),
            other => Err(RelayError::InvalidRole(other.to_string())),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StreamRole::Broadcaster => "broadcaster",
            StreamRole::Viewer => "viewer",
        }
    }
}

/// Relay errors, reported to the offending socket as an `error` notice.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Malformed relay command: {0}")]
    Malformed(String),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Stream name is required")]
    MissingStream,

    #[error("Client id is required")]
    MissingClientId,

    #[error("Socket has not joined a stream")]
    NotJoined,

    #[error("Not the active broadcaster")]
    NotBroadcaster,

    #[error("Unknown relay socket")]
    UnknownSocket,
}

impl RelayError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::NotBroadcaster => ErrorCode::Forbidden,
            RelayError::UnknownSocket => ErrorCode::NotFound,
            _ => ErrorCode::BadRequest,
        }
    }
}

#[derive(Debug, Clone)]
struct Registration {
    client_id: String,
    role: StreamRole,
    outbox: Outbox,
}

#[derive(Debug)]
struct Socket {
    plane: Plane,
    outbox: Outbox,
    stream: Option<String>,
}

/// Registrations and state of one named stream.
#[derive(Debug, Default)]
struct StreamSession {
    control: HashMap<ConnectionId, Registration>,
    media: HashMap<ConnectionId, Registration>,
    /// Control socket of the active broadcaster.
    broadcaster: Option<ConnectionId>,
    started_at: Option<u64>,
    ended_at: Option<u64>,
}

impl StreamSession {
    fn plane(&self, plane: Plane) -> &HashMap<ConnectionId, Registration> {
        match plane {
            Plane::Control => &self.control,
            Plane::Media => &self.media,
        }
    }

    fn plane_mut(&mut self, plane: Plane) -> &mut HashMap<ConnectionId, Registration> {
        match plane {
            Plane::Control => &mut self.control,
            Plane::Media => &mut self.media,
        }
    }

    fn state(&self) -> StreamState {
        if self.broadcaster.is_some() {
            StreamState::Live
        } else {
            StreamState::Idle
        }
    }

    fn broadcaster_client(&self) -> Option<&str> {
        let conn = self.broadcaster.as_ref()?;
        self.control.get(conn).map(|r| r.client_id.as_str())
    }

    fn viewers(&self) -> usize {
        let mut clients: Vec<&str> = self
            .control
            .values()
            .chain(self.media.values())
            .filter(|r| r.role == StreamRole::Viewer)
            .map(|r| r.client_id.as_str())
            .collect();
        clients.sort_unstable();
        clients.dedup();
        clients.len()
    }

    fn lifecycle(&self) -> Lifecycle {
        if self.control.is_empty() && self.media.is_empty() {
            Lifecycle::Empty
        } else {
            Lifecycle::Active
        }
    }

    fn notice(&self, stream: &str) -> RelayNotice {
        RelayNotice::State {
            stream: stream.to_string(),
            state: self.state(),
            broadcaster: self.broadcaster.is_some(),
            viewers: self.viewers(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    fn broadcast_state(&self, stream: &str) {
        let text = self.notice(stream).to_text();
        for reg in self.control.values() {
            reg.outbox.send(Outbound::Text(text.clone()));
        }
    }

    /// Remove a registration, ending the broadcast if it held it.
    fn remove(&mut self, plane: Plane, conn: &ConnectionId) -> Option<Registration> {
        let removed = self.plane_mut(plane).remove(conn)?;
        if plane == Plane::Control && self.broadcaster.as_ref() == Some(conn) {
            self.broadcaster = None;
            self.ended_at = Some(now_millis());
        }
        Some(removed)
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub sessions: usize,
    pub sockets: usize,
}

/// Owner of every stream session and relay socket.
#[derive(Debug, Default)]
pub struct StreamRelay {
    sockets: DashMap<ConnectionId, Socket>,
    sessions: DashMap<String, StreamSession>,
}

impl StreamRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly upgraded relay socket.
    pub fn attach(&self, plane: Plane, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId::generate();
        self.sockets.insert(
            id.clone(),
            Socket {
                plane,
                outbox,
                stream: None,
            },
        );
        debug!(connection = %id, plane = plane.as_str(), "Relay socket attached");
        id
    }

    /// Handle a text command. Failures are reported to the socket and returned.
    ///
    /// # Errors
    ///
    /// Returns the error that was reported to the socket.
    pub fn on_text(&self, conn: &ConnectionId, raw: &str) -> Result<(), RelayError> {
        let result = serde_json::from_str::<RelayCommand>(raw)
            .map_err(|e| RelayError::Malformed(e.to_string()))
            .and_then(|command| self.command(conn, command));
        if let Err(err) = &result {
            self.notify(conn, &RelayNotice::error(err.code(), err.to_string()));
        }
        result
    }

    fn command(&self, conn: &ConnectionId, command: RelayCommand) -> Result<(), RelayError> {
        match command {
            RelayCommand::Join {
                stream,
                role,
                client_id,
            } => self.join(conn, &stream, &role, &client_id),
            RelayCommand::Leave => {
                if self.leave(conn) {
                    Ok(())
                } else {
                    Err(RelayError::NotJoined)
                }
            }
            RelayCommand::State => {
                let stream = self.stream_of(conn)?.ok_or(RelayError::NotJoined)?;
                let notice = self.state(&stream).unwrap_or(RelayNotice::State {
                    stream,
                    state: StreamState::Idle,
                    broadcaster: false,
                    viewers: 0,
                    started_at: None,
                    ended_at: None,
                });
                self.notify(conn, &notice);
                Ok(())
            }
        }
    }

    /// Register a socket on a stream.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown socket, an empty stream name or client
    /// id, or a role other than broadcaster or viewer.
    pub fn join(
        &self,
        conn: &ConnectionId,
        stream: &str,
        role: &str,
        client_id: &str,
    ) -> Result<(), RelayError> {
        let role = StreamRole::parse(role)?;
        if stream.trim().is_empty() {
            return Err(RelayError::MissingStream);
        }
        if client_id.trim().is_empty() {
            return Err(RelayError::MissingClientId);
        }
        let (plane, outbox) = {
            let socket = self.sockets.get(conn).ok_or(RelayError::UnknownSocket)?;
            (socket.plane, socket.outbox.clone())
        };

        // A socket holds one registration at a time.
        self.leave(conn);

        let mut evicted = Vec::new();
        {
            let mut session = self.sessions.entry(stream.to_string()).or_default();

            // Stale registrations from the same client on this plane go first.
            let stale: Vec<ConnectionId> = session
                .plane(plane)
                .iter()
                .filter(|(_, r)| r.client_id == client_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                if let Some(reg) = session.remove(plane, &id) {
                    evicted.push((id, reg));
                }
            }

            if plane == Plane::Control && role == StreamRole::Broadcaster {
                self.take_over(&mut session, stream, conn);
                session.broadcaster = Some(conn.clone());
                session.started_at = Some(now_millis());
                session.ended_at = None;
            }

            session.plane_mut(plane).insert(
                conn.clone(),
                Registration {
                    client_id: client_id.to_string(),
                    role,
                    outbox: outbox.clone(),
                },
            );

            outbox.send(Outbound::Text(
                RelayNotice::Joined {
                    stream: stream.to_string(),
                    role: role.as_str().to_string(),
                    client_id: client_id.to_string(),
                }
                .to_text(),
            ));
            session.broadcast_state(stream);
        }

        if let Some(mut socket) = self.sockets.get_mut(conn) {
            socket.stream = Some(stream.to_string());
        }
        for (id, reg) in evicted {
            if let Some(mut socket) = self.sockets.get_mut(&id) {
                socket.stream = None;
            }
            reg.outbox.send(Outbound::Close);
            debug!(connection = %id, stream = %stream, "Stale relay registration evicted");
        }

        info!(
            connection = %conn,
            stream = %stream,
            plane = plane.as_str(),
            role = role.as_str(),
            client = %client_id,
            "Relay join"
        );
        Ok(())
    }

    /// Demote the current broadcaster of a stream in favour of `incoming`.
    fn take_over(&self, session: &mut StreamSession, stream: &str, incoming: &ConnectionId) {
        let Some(previous) = session.broadcaster.take() else {
            return;
        };
        if &previous == incoming {
            return;
        }
        let notice = RelayNotice::Takeover {
            stream: stream.to_string(),
        }
        .to_text();

        let Some(reg) = session.control.get_mut(&previous) else {
            return;
        };
        reg.role = StreamRole::Viewer;
        reg.outbox.send(Outbound::Text(notice.clone()));
        let client = reg.client_id.clone();

        // Its media socket keeps the broadcaster role but fails the client id gate.
        for reg in session
            .media
            .values()
            .filter(|r| r.client_id == client && r.role == StreamRole::Broadcaster)
        {
            reg.outbox.send(Outbound::Text(notice.clone()));
        }
        info!(stream = %stream, previous = %previous, client = %client, "Broadcaster taken over");
    }

    /// Drop a socket's registration. Returns `true` if it had one.
    pub fn leave(&self, conn: &ConnectionId) -> bool {
        let (plane, stream) = {
            let Some(mut socket) = self.sockets.get_mut(conn) else {
                return false;
            };
            let Some(stream) = socket.stream.take() else {
                return false;
            };
            (socket.plane, stream)
        };

        let lifecycle = {
            let Some(mut session) = self.sessions.get_mut(&stream) else {
                return false;
            };
            session.remove(plane, conn);
            let lifecycle = session.lifecycle();
            if lifecycle == Lifecycle::Active {
                session.broadcast_state(&stream);
            }
            lifecycle
        };
        if lifecycle == Lifecycle::Empty {
            self.settle(&stream);
        }
        debug!(connection = %conn, stream = %stream, "Relay leave");
        true
    }

    /// Remove a session once it has no registrations.
    fn settle(&self, stream: &str) -> Lifecycle {
        if self
            .sessions
            .remove_if(stream, |_, s| s.lifecycle() == Lifecycle::Empty)
            .is_some()
        {
            debug!(stream = %stream, "Stream session removed");
            Lifecycle::Removed
        } else if self.sessions.contains_key(stream) {
            Lifecycle::Active
        } else {
            Lifecycle::Removed
        }
    }

    /// Relay a binary frame to every media viewer of the sender's stream.
    ///
    /// Returns the number of viewers the frame was queued for.
    ///
    /// # Errors
    ///
    /// Returns an error unless the sender joined the media plane as
    /// broadcaster and its client id matches the stream's control broadcaster.
    pub fn relay_frame(&self, conn: &ConnectionId, frame: Bytes) -> Result<usize, RelayError> {
        let stream = self.stream_of(conn)?.ok_or(RelayError::NotJoined)?;
        let session = self.sessions.get(&stream).ok_or(RelayError::NotJoined)?;
        let sender = session.media.get(conn).ok_or(RelayError::NotBroadcaster)?;
        if sender.role != StreamRole::Broadcaster
            || session.broadcaster_client() != Some(sender.client_id.as_str())
        {
            return Err(RelayError::NotBroadcaster);
        }

        let mut delivered = 0;
        for (id, reg) in &session.media {
            if id != conn && reg.role == StreamRole::Viewer && reg.outbox.send(Outbound::Binary(frame.clone())) {
                delivered += 1;
            }
        }
        trace!(stream = %stream, bytes = frame.len(), delivered, "Frame relayed");
        Ok(delivered)
    }

    /// Relay a frame, reporting rejection to the sender.
    ///
    /// # Errors
    ///
    /// Returns the error that was reported to the socket.
    pub fn on_frame(&self, conn: &ConnectionId, frame: Bytes) -> Result<usize, RelayError> {
        let result = self.relay_frame(conn, frame);
        if let Err(err) = &result {
            self.notify(conn, &RelayNotice::error(err.code(), err.to_string()));
        }
        result
    }

    /// Forget a closed socket. Idempotent.
    pub fn detach(&self, conn: &ConnectionId) {
        self.leave(conn);
        if self.sockets.remove(conn).is_some() {
            debug!(connection = %conn, "Relay socket detached");
        }
    }

    /// Current state of a stream, if it has a session.
    #[must_use]
    pub fn state(&self, stream: &str) -> Option<RelayNotice> {
        self.sessions.get(stream).map(|s| s.notice(stream))
    }

    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            sessions: self.sessions.len(),
            sockets: self.sockets.len(),
        }
    }

    fn stream_of(&self, conn: &ConnectionId) -> Result<Option<String>, RelayError> {
        self.sockets
            .get(conn)
            .map(|s| s.stream.clone())
            .ok_or(RelayError::UnknownSocket)
    }

    fn notify(&self, conn: &ConnectionId, notice: &RelayNotice) {
        if let Some(socket) = self.sockets.get(conn) {
            socket.outbox.send(Outbound::Text(notice.to_text()));
        }
    }
}
