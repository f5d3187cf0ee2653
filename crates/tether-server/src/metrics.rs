//! Metrics collection and export for Tether.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tether_core::{CoordinatorStats, Dispatched, RelayStats};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tether_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
    pub const ENVELOPES_TOTAL: &str = "tether_envelopes_total";
    pub const ENVELOPES_BYTES: &str = "tether_envelopes_bytes";
    pub const DISPATCH_SECONDS: &str = "tether_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
    pub const USERS_ONLINE: &str = "tether_users_online";
    pub const CALLS_ACTIVE: &str = "tether_calls_active";
    pub const PEERS_ACTIVE: &str = "tether_peers_active";
    pub const RELAY_FRAMES_TOTAL: &str = "tether_relay_frames_total";
    pub const RELAY_BYTES: &str = "tether_relay_bytes";
    pub const RELAY_SESSIONS_ACTIVE: &str = "tether_relay_sessions_active";
}

/// Which upgrade path a socket came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    App,
    Control,
    Media,
}

impl Transport {
    fn as_str(self) -> &'static str {
        match self {
            Transport::App => "app",
            Transport::Control => "control",
            Transport::Media => "media",
        }
    }
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of sockets accepted since server start"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Current number of open sockets");
    metrics::describe_counter!(names::ENVELOPES_TOTAL, "Envelopes dispatched, by type and outcome");
    metrics::describe_counter!(names::ENVELOPES_BYTES, "Total bytes of inbound envelopes");
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Envelope dispatch latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors, by code");
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one authenticated connection");
    metrics::describe_gauge!(names::CALLS_ACTIVE, "Calls with at least one peer");
    metrics::describe_gauge!(names::PEERS_ACTIVE, "Peers seated in calls");
    metrics::describe_counter!(names::RELAY_FRAMES_TOTAL, "Media frames accepted by the relay");
    metrics::describe_counter!(names::RELAY_BYTES, "Media bytes fanned out to viewers");
    metrics::describe_gauge!(names::RELAY_SESSIONS_ACTIVE, "Stream sessions with registrations");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record one dispatched envelope.
pub fn record_dispatch(bytes: usize, outcome: &Dispatched, elapsed: Duration) {
    let kind = outcome.kind.clone().unwrap_or_else(|| "invalid".to_string());
    let result = if outcome.error.is_some() { "error" } else { "ok" };
    counter!(names::ENVELOPES_TOTAL, "type" => kind, "result" => result).increment(1);
    counter!(names::ENVELOPES_BYTES).increment(bytes as u64);
    histogram!(names::DISPATCH_SECONDS).record(elapsed.as_secs_f64());
    if let Some(code) = outcome.error {
        record_error(code.as_str());
    }
}

/// Refresh registry gauges.
pub fn set_coordinator_stats(stats: CoordinatorStats) {
    gauge!(names::USERS_ONLINE).set(stats.users as f64);
    gauge!(names::CALLS_ACTIVE).set(stats.calls as f64);
    gauge!(names::PEERS_ACTIVE).set(stats.peers as f64);
}

/// Record a relayed media frame.
pub fn record_relay_frame(bytes: usize, viewers: usize) {
    counter!(names::RELAY_FRAMES_TOTAL).increment(1);
    counter!(names::RELAY_BYTES).increment((bytes * viewers) as u64);
}

/// Refresh relay gauges.
pub fn set_relay_stats(stats: RelayStats) {
    gauge!(names::RELAY_SESSIONS_ACTIVE).set(stats.sessions as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    transport: Transport,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        counter!(names::CONNECTIONS_TOTAL, "transport" => transport.as_str()).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE, "transport" => transport.as_str()).increment(1.0);
        Self { transport }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE, "transport" => self.transport.as_str()).decrement(1.0);
    }
}
