//! Host-side management of l2link tunnels
//!
//! Configuration, the CLI/daemon control protocol, the management operations
//! shared by the daemon and the in-process CLI, and the daemon itself.

pub mod config;
pub mod daemon;
pub mod ipc;
pub mod manager;

pub use config::{L2linkConfig, CONFIG_FILE, DEFAULT_CONFIG_DIR};
pub use daemon::{Daemon, DaemonCommand};
pub use ipc::{
    HostStatus, IpcClient, IpcConnection, IpcRequest, IpcResponse, IpcServer, LifecycleOutcome,
    TunnelStatus,
};
pub use manager::Manager;
