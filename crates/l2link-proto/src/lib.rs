//! Tunnel record definitions
//!
//! This crate defines the persisted tunnel schema shared by the registry,
//! the lifecycle controller, the forwarding daemon and the management CLI.

pub mod error;
pub mod record;

pub use error::ProtoError;
pub use record::{
    check_interface, check_interface_index, parse_port_list, validate_name, validate_ports,
    IdentifierField, Side, TunnelCandidate, TunnelIds, TunnelRecord,
};

/// Schema version written into every persisted record
pub const RECORD_VERSION: u32 = 1;

/// Default private pool the `/30` link subnets are carved from
pub const DEFAULT_POOL: &str = "10.30.0.0/16";

/// Prefix length of a point-to-point link subnet
pub const LINK_PREFIX: u8 = 30;

/// Kernel interface name prefix (`l2tpeth0`, `l2tpeth1`, ...)
pub const INTERFACE_PREFIX: &str = "l2tpeth";

/// Highest interface slot; `l2tpeth` plus eight digits fills IFNAMSIZ (15)
pub const MAX_INTERFACE_INDEX: u32 = 99_999_999;

/// Kernel modules that must be present before any tunnel operation
pub const REQUIRED_MODULES: [&str; 3] = ["l2tp_core", "l2tp_netlink", "l2tp_eth"];

/// Name of the kernel interface backing a given interface slot
pub fn interface_name(index: u32) -> String {
    format!("{}{}", INTERFACE_PREFIX, index)
}
