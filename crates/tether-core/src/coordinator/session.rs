//! `hello` and `auth.*` handlers.

use super::{Coordinator, Request};
use crate::error::DomainError;
use crate::ids::ConnectionId;
use serde::Deserialize;
use serde_json::{json, Value};
use tether_protocol::PROTOCOL_VERSION;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
struct HelloBody {
    #[serde(default)]
    resume: Option<Resume>,
}

#[derive(Debug, Default, Deserialize)]
struct Resume {
    #[serde(default)]
    token: Option<String>,
}

impl Coordinator {
    pub(super) async fn hello(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let body: HelloBody = req.body()?;
        let token = body
            .resume
            .and_then(|r| r.token)
            .filter(|t| !t.is_empty());

        if let Some(token) = token {
            match self.identity.resume(&token).await? {
                Some(user) => {
                    self.authenticate(req.conn, &user, Some(token)).await;
                    req.user = Some(user);
                }
                None => debug!(connection = %req.conn, "Resume token not recognised"),
            }
        }

        let mut session = json!({ "authenticated": req.user.is_some() });
        if let Some(user) = &req.user {
            session["user_id"] = json!(user);
        }
        Ok(json!({
            "connection_id": req.conn,
            "heartbeat_ms": self.config.heartbeat_ms,
            "protocol": PROTOCOL_VERSION,
            "session": session,
        }))
    }

    pub(super) async fn login(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let grant = self.identity.login(&req.envelope.body).await?;
        self.authenticate(req.conn, &grant.user_id, Some(grant.token.clone()))
            .await;
        req.user = Some(grant.user_id.clone());
        Ok(json!({ "user_id": grant.user_id, "token": grant.token }))
    }

    pub(super) async fn logout(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let token = self
            .connections
            .get(req.conn)
            .and_then(|e| e.token.clone());
        if let Some(token) = token {
            self.identity.logout(&token).await?;
        }
        self.deauthenticate(req.conn, &mut req.fanouts).await;
        req.user = None;
        info!(connection = %req.conn, user = %user, "Logged out");
        Ok(json!({}))
    }

    pub(super) fn me(&self, req: &mut Request<'_>) -> Result<Value, DomainError> {
        let user = req.user()?;
        let connections = self.presence.connections_for_user(&user).len();
        Ok(json!({ "user_id": user, "connections": connections }))
    }

    /// Bind a connection to a user, replacing any previous identity.
    async fn authenticate(&self, conn: &ConnectionId, user: &str, token: Option<String>) {
        let previous = self.user_of(conn);
        if previous.as_deref() == Some(user) {
            if let Some(mut entry) = self.connections.get_mut(conn) {
                entry.token = token;
            }
            return;
        }
        if previous.is_some() {
            let mut fanouts = Vec::new();
            self.deauthenticate(conn, &mut fanouts).await;
            self.deliver(fanouts, Some(conn));
        }

        let bound = match self.connections.get_mut(conn) {
            Some(mut entry) => {
                entry.user_id = Some(user.to_string());
                entry.token = token;
                true
            }
            None => false,
        };
        if bound {
            let came_online = self.presence.add_connection(user, conn);
            info!(connection = %conn, user = %user, came_online, "Authenticated");
        }
    }

    /// Drop a connection's identity: its seat, presence and token.
    async fn deauthenticate(&self, conn: &ConnectionId, fanouts: &mut Vec<super::Fanout>) {
        self.vacate_seat(conn, fanouts).await;
        self.presence.remove_connection(conn);
        if let Some(mut entry) = self.connections.get_mut(conn) {
            entry.user_id = None;
            entry.token = None;
        }
    }
}
