//! Configuration.
//!
//! The socket core reads a small TOML document:
//!
//! ```toml
//! [engine]
//! backend = "auto"          # auto | poll | epoll | kqueue
//! max_descriptors = 4096    # defaults to the process descriptor limit
//! dispatch_timeout = "1s"
//!
//! [[bind]]
//! address = "203.0.113.7"
//! port = 7000
//! type = "servers"
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```
//!
//! Every section is optional.

use crate::engine::Backend;

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub bind: Vec<BindConfig>,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parses a configuration document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Readiness engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Polling backend.
    pub backend: Backend,

    /// Descriptor table size. Defaults to the soft `RLIMIT_NOFILE`.
    pub max_descriptors: Option<usize>,

    /// Upper bound on a single wait for readiness.
    #[serde(with = "humantime_serde")]
    pub dispatch_timeout: Duration,

    /// Bytes read from a socket per `recv` call.
    pub read_buffer: usize,

    /// Kernel send/receive buffer size requested for new connections.
    pub socket_buffer: usize,

    /// Connections accepted per readiness event on a listener.
    pub accept_batch: usize,

    /// Backlog passed to `listen(2)`.
    pub listen_backlog: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            max_descriptors: None,
            dispatch_timeout: Duration::from_secs(1),
            read_buffer: 65536,
            socket_buffer: 32768,
            accept_batch: 16,
            listen_backlog: 128,
        }
    }
}

/// Which kind of peer a configured port serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindKind {
    #[default]
    Clients,
    Servers,
}

/// A configured listening address.
#[derive(Debug, Clone, Deserialize)]
pub struct BindConfig {
    /// Local address; empty or `*` means every interface.
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(rename = "type", default)]
    pub kind: BindKind,
}

impl BindConfig {
    pub fn new(address: impl Into<String>, kind: BindKind) -> Self {
        Self {
            address: address.into(),
            port: None,
            kind,
        }
    }

    /// The concrete IP of this bind, `None` for wildcard binds.
    pub fn ip(&self) -> Option<IpAddr> {
        let address = self.address.trim();
        if address.is_empty() || address == "*" {
            return None;
        }

        match address.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                debug!(address, "bind address is not an IP address");
                None
            }
        }
    }
}

/// Picks the local address an outbound connection to `dest` binds to.
///
/// Outbound server links bind to the first server-port address that is a
/// real interface address (not loopback, not a wildcard) of the same
/// family as the destination. IPv4-mapped IPv6 destinations never bind.
pub fn outbound_bind_address(binds: &[BindConfig], dest: &SocketAddr) -> Option<IpAddr> {
    if let SocketAddr::V6(v6) = dest {
        if v6.ip().to_ipv4_mapped().is_some() {
            return None;
        }
    }

    binds
        .iter()
        .filter(|b| b.kind == BindKind::Servers)
        .filter_map(BindConfig::ip)
        .find(|ip| !ip.is_loopback() && !ip.is_unspecified() && ip.is_ipv4() == dest.is_ipv4())
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

/// Logging settings, consumed by [`crate::logging::init`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
    pub timestamps: bool,
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            timestamps: true,
            target: true,
        }
    }
}
