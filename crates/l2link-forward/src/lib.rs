//! TCP port forwarding over established tunnels
//!
//! The [`ForwardingDaemon`] keeps exactly one listener per `(tunnel, port)`
//! pair declared by the tunnel records and relays every accepted connection
//! to the tunnel's `remote_forward_ip` on the same port.

pub mod daemon;
pub mod error;
pub mod listener;
pub mod relay;
pub mod stats;

pub use daemon::{
    ForwardingDaemon, ListenerFailure, ListenerState, ListenerStatus, ReconcileReport,
};
pub use error::ForwardError;
pub use stats::{ListenerStats, StatsSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Default outbound connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwarding daemon settings
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Address listeners bind to
    pub listen_address: Ipv4Addr,
    pub connect_timeout: Duration,
    /// Bind attempts per listener while the port is still in use
    pub bind_attempts: u32,
    pub bind_retry_delay: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            listen_address: Ipv4Addr::UNSPECIFIED,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            bind_attempts: 3,
            bind_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Identity of one listener
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerKey {
    pub tunnel: String,
    pub port: u16,
}

impl ListenerKey {
    pub fn new(tunnel: impl Into<String>, port: u16) -> Self {
        Self {
            tunnel: tunnel.into(),
            port,
        }
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tunnel, self.port)
    }
}
