//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - built-in defaults
//! - the first TOML file found among `tether.toml`, `/etc/tether/tether.toml`
//!   and `~/.config/tether/tether.toml`
//! - environment variables (`TETHER_PORT`, `TETHER_LIMITS__OUTBOX_CAPACITY`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tether_core::outbound::DEFAULT_OUTBOX_CAPACITY;
use tether_core::CoordinatorConfig;
use tether_protocol::codec::MAX_ENVELOPE_SIZE;

const CONFIG_PATHS: [&str; 3] = [
    "tether.toml",
    "/etc/tether/tether.toml",
    "~/.config/tether/tether.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upgrade paths.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits for application connections.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat advertised in `hello_ack`.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Stream relay configuration.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Accounts registered with the in-memory identity provider at start-up.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    /// Users allowed to manage every hub.
    #[serde(default)]
    pub admins: Vec<String>,
}

/// Upgrade path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for application connections.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Path for relay control sockets.
    #[serde(default = "default_control_path")]
    pub control_path: String,

    /// Path for relay media sockets.
    #[serde(default = "default_media_path")]
    pub media_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum raw envelope size in bytes.
    #[serde(default = "default_max_envelope_size")]
    pub max_envelope_size: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Stream relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Serve the control and media paths.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Largest media frame accepted, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Outbound queue capacity per relay socket.
    #[serde(default = "default_relay_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// A username/password pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_control_path() -> String {
    "/stream/control".to_string()
}

fn default_media_path() -> String {
    "/stream/media".to_string()
}

fn default_max_envelope_size() -> usize {
    MAX_ENVELOPE_SIZE
}

fn default_outbox_capacity() -> usize {
    DEFAULT_OUTBOX_CAPACITY
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_relay_outbox_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            relay: RelayConfig::default(),
            accounts: Vec::new(),
            admins: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ws_path: default_ws_path(),
            control_path: default_control_path(),
            media_path: default_media_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_envelope_size: default_max_envelope_size(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_frame_size: default_max_frame_size(),
            outbox_capacity: default_relay_outbox_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from the default paths and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists())
        {
            tracing::info!(path = %path, "Loading config file");
            builder = builder.add_source(::config::File::new(&path, ::config::FileFormat::Toml));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("TETHER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Coordinator settings derived from this config.
    #[must_use]
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            heartbeat_ms: self.heartbeat.interval_ms,
            max_envelope_size: self.limits.max_envelope_size,
            outbox_capacity: self.limits.outbox_capacity,
        }
    }
}
