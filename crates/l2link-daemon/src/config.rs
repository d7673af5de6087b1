//! Host configuration
//!
//! Read from `{config_dir}/config.json` (`/etc/l2link/config.json` by
//! default). A missing file means all defaults; unknown keys are rejected.

use anyhow::{Context, Result};
use l2link_forward::ForwardConfig;
use l2link_registry::AddressPool;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/l2link";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct L2linkConfig {
    /// Root of persisted state; records live in `{state_dir}/tunnels`
    pub state_dir: PathBuf,
    /// Private pool link subnets are allocated from
    pub pool: String,
    /// Address forwarding listeners bind to
    pub listen_address: Ipv4Addr,
    pub connect_timeout_secs: u64,
    pub bind_attempts: u32,
    /// Daemon control socket
    pub socket_path: PathBuf,
    /// Bring every tunnel up when the daemon starts
    pub apply_on_start: bool,
}

impl Default for L2linkConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            pool: l2link_proto::DEFAULT_POOL.to_string(),
            listen_address: Ipv4Addr::UNSPECIFIED,
            connect_timeout_secs: 10,
            bind_attempts: 3,
            socket_path: PathBuf::from("/run/l2link/daemon.sock"),
            apply_on_start: true,
        }
    }
}

impl L2linkConfig {
    /// Load the configuration from a config directory
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);

        // Return default config if file doesn't exist
        if !path.exists() {
            return Ok(Self::default());
        }

        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.address_pool()?;
        Ok(config)
    }

    pub fn tunnels_dir(&self) -> PathBuf {
        self.state_dir.join("tunnels")
    }

    pub fn address_pool(&self) -> Result<AddressPool> {
        AddressPool::parse(&self.pool).with_context(|| format!("Invalid pool '{}'", self.pool))
    }

    pub fn forward_config(&self) -> ForwardConfig {
        ForwardConfig {
            listen_address: self.listen_address,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            bind_attempts: self.bind_attempts,
            ..ForwardConfig::default()
        }
    }
}
