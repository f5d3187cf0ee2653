//! Connection handlers for the Tether server.
//!
//! Every socket is split in two: a writer task drains the socket's outbox,
//! and the reader loop feeds inbound frames to the coordinator or the relay
//! in arrival order. Leaving the reader loop is the only cleanup path.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, Transport};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tether_core::{
    ConnectionId, Coordinator, MemoryDirectory, MemoryIdentity, MemoryMessageStore, Outbound,
    Outbox, Plane, StreamRelay,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Shared server state.
pub struct AppState {
    /// Application connection registry and dispatcher.
    pub coordinator: Coordinator,
    /// Stream relay for the control and media paths.
    pub relay: StreamRelay,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state with in-memory collaborators seeded from config.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let identity = Arc::new(MemoryIdentity::new());
        for account in &config.accounts {
            identity.register(&account.username, &account.password);
        }

        let directory = Arc::new(MemoryDirectory::new());
        for admin in &config.admins {
            directory.grant_admin(admin);
        }

        info!(
            accounts = config.accounts.len(),
            admins = config.admins.len(),
            "Seeded in-memory collaborators"
        );

        Self {
            coordinator: Coordinator::new(
                config.coordinator(),
                identity,
                directory,
                Arc::new(MemoryMessageStore::new()),
            ),
            relay: StreamRelay::new(),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Tether server listening on {}", addr);
    info!("Application endpoint: ws://{}{}", addr, config.transport.ws_path);
    if config.relay.enabled {
        info!(
            "Relay endpoints: ws://{addr}{} (control), ws://{addr}{} (media)",
            config.transport.control_path, config.transport.media_path
        );
    }

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the HTTP router for the configured paths.
fn router(state: Arc<AppState>) -> Router {
    let config = &state.config;
    let mut app: Router<Arc<AppState>> = Router::new()
        .route(&config.transport.ws_path, get(ws_handler))
        .route("/health", get(health_handler));
    if config.relay.enabled {
        app = app
            .route(&config.transport.control_path, get(control_handler))
            .route(&config.transport.media_path, get(media_handler));
    }
    app.with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.coordinator.stats();
    let relay = state.relay.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connections,
        "users": stats.users,
        "calls": stats.calls,
        "streams": relay.sessions,
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Frames over the envelope limit fail the read instead of being buffered whole.
    let max_envelope = state.config.limits.max_envelope_size;
    ws.max_message_size(max_envelope)
        .on_upgrade(move |socket| handle_app_socket(socket, state))
}

async fn control_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_relay_socket(socket, state, Plane::Control))
}

async fn media_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Oversized media frames fail the read and close the socket.
    let max_frame = state.config.relay.max_frame_size;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_relay_socket(socket, state, Plane::Media))
}

/// Handle an application connection.
async fn handle_app_socket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new(Transport::App);

    let (sender, mut receiver) = socket.split();
    let (outbox, outbound) = Outbox::channel(state.config.limits.outbox_capacity);
    let conn = state.coordinator.accept(outbox);
    let writer = tokio::spawn(write_outbound(sender, outbound, conn.clone()));

    debug!(connection = %conn, "WebSocket connected");

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => dispatch(&state, &conn, &text).await,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => dispatch(&state, &conn, &text).await,
                Err(_) => {
                    warn!(connection = %conn, "Dropping non UTF-8 binary frame");
                    metrics::record_error("binary_frame");
                }
            },
            // tungstenite answers pings itself.
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(connection = %conn, "Received close frame");
                break;
            }
            Err(e) => {
                warn!(connection = %conn, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    state.coordinator.close(&conn).await;
    metrics::set_coordinator_stats(state.coordinator.stats());
    writer.abort();

    debug!(connection = %conn, "WebSocket disconnected");
}

async fn dispatch(state: &AppState, conn: &ConnectionId, text: &str) {
    let start = Instant::now();
    let outcome = state.coordinator.on_envelope(conn, text).await;
    metrics::record_dispatch(text.len(), &outcome, start.elapsed());
    if outcome.error.is_none() {
        metrics::set_coordinator_stats(state.coordinator.stats());
    }
}

/// Handle a relay control or media socket.
async fn handle_relay_socket(socket: WebSocket, state: Arc<AppState>, plane: Plane) {
    let transport = match plane {
        Plane::Control => Transport::Control,
        Plane::Media => Transport::Media,
    };
    let _metrics_guard = ConnectionMetricsGuard::new(transport);

    let (sender, mut receiver) = socket.split();
    let (outbox, outbound) = Outbox::channel(state.config.relay.outbox_capacity);
    let conn = state.relay.attach(plane, outbox);
    let writer = tokio::spawn(write_outbound(sender, outbound, conn.clone()));

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) = state.relay.on_text(&conn, &text) {
                    debug!(connection = %conn, error = %e, "Relay command rejected");
                    metrics::record_error(e.code().as_str());
                }
                metrics::set_relay_stats(state.relay.stats());
            }
            Ok(Message::Binary(data)) => {
                let len = data.len();
                match state.relay.on_frame(&conn, Bytes::from(data)) {
                    Ok(viewers) => metrics::record_relay_frame(len, viewers),
                    Err(e) => {
                        trace!(connection = %conn, error = %e, "Frame rejected");
                        metrics::record_error(e.code().as_str());
                    }
                }
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                warn!(connection = %conn, plane = plane.as_str(), error = %e, "Relay socket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    state.relay.detach(&conn);
    metrics::set_relay_stats(state.relay.stats());
    writer.abort();
}

/// Drain a socket's outbox into the WebSocket sink.
async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    conn: ConnectionId,
) {
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Binary(data) => Message::Binary(data.to_vec()),
            Outbound::Close => {
                debug!(connection = %conn, "Closing socket on request");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        };
        if sender.send(message).await.is_err() {
            trace!(connection = %conn, "Socket writer stopped");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountConfig;
    use serde_json::json;
    use tether_protocol::{codec, kinds, Envelope};

    #[tokio::test]
    async fn test_app_state_seeds_accounts() {
        let config = Config {
            accounts: vec![AccountConfig {
                username: "alice".to_string(),
                password: "pw".to_string(),
            }],
            ..Config::default()
        };
        let state = AppState::new(config);
        let (outbox, mut rx) = Outbox::channel(8);
        let conn = state.coordinator.accept(outbox);

        let login = Envelope::request(
            kinds::AUTH_LOGIN,
            "l1",
            json!({"username": "alice", "password": "pw"}),
        );
        let outcome = state
            .coordinator
            .on_envelope(&conn, &codec::encode(&login).unwrap())
            .await;
        assert!(outcome.error.is_none());

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected a text reply");
        };
        let reply: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(reply.body["user_id"], json!("alice"));
        assert_eq!(state.coordinator.user_of(&conn).as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_unknown_account_is_rejected() {
        let state = AppState::new(Config::default());
        let (outbox, _rx) = Outbox::channel(8);
        let conn = state.coordinator.accept(outbox);

        let login = Envelope::request(
            kinds::AUTH_LOGIN,
            "l1",
            json!({"username": "nobody", "password": "pw"}),
        );
        let outcome = state
            .coordinator
            .on_envelope(&conn, &codec::encode(&login).unwrap())
            .await;
        assert!(outcome.error.is_some());
        assert!(state.coordinator.user_of(&conn).is_none());
    }

    #[tokio::test]
    async fn test_oversized_app_frame_closes_socket() {
        use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

        let mut config = Config::default();
        config.limits.max_envelope_size = 1024;
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { axum::serve(listener, router(state)).await });

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

        // Under the limit: answered by the coordinator.
        let ping = Envelope::request(kinds::PING, "p1", json!({}));
        ws.send(WsMessage::Text(codec::encode(&ping).unwrap()))
            .await
            .unwrap();
        let Some(Ok(WsMessage::Text(text))) = ws.next().await else {
            panic!("expected a pong");
        };
        let reply: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(reply.t, kinds::PONG);

        // Over the limit: the socket read fails and no error envelope comes back.
        let big = Envelope::request(kinds::PING, "p2", json!({ "pad": "x".repeat(4096) }));
        let _ = ws
            .send(WsMessage::Text(codec::encode(&big).unwrap()))
            .await;
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
            .await
            .expect("socket neither answered nor closed");
        assert!(
            !matches!(next, Some(Ok(WsMessage::Text(_)))),
            "oversized frame reached the coordinator: {next:?}"
        );

        server.abort();
    }
}
