//! OS tunnel-management boundary

use crate::LifecycleError;
use ipnetwork::Ipv4Network;
use l2link_proto::TunnelRecord;
use std::net::Ipv4Addr;

/// Parameters of a kernel L2TPv3 tunnel (IP encapsulation)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub tunnel_id: u32,
    pub peer_tunnel_id: u32,
    pub local: Ipv4Addr,
    pub remote: Ipv4Addr,
}

impl TunnelSpec {
    pub fn for_record(record: &TunnelRecord) -> Self {
        Self {
            tunnel_id: record.tunnel_id,
            peer_tunnel_id: record.peer_tunnel_id,
            local: record.local_public_ip,
            remote: record.remote_public_ip,
        }
    }
}

/// Parameters of a kernel L2TPv3 session and the interface it creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub tunnel_id: u32,
    pub session_id: u32,
    pub peer_session_id: u32,
    pub interface: String,
}

impl SessionSpec {
    pub fn for_record(record: &TunnelRecord) -> Self {
        Self {
            tunnel_id: record.tunnel_id,
            session_id: record.session_id,
            peer_session_id: record.peer_session_id,
            interface: record.interface_name(),
        }
    }
}

/// Link state and IPv4 addresses of a network interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceState {
    pub up: bool,
    pub addresses: Vec<Ipv4Network>,
}

/// Narrow interface to the kernel's tunnel management.
///
/// Calls are blocking. `query_*` return `Ok(None)` when the object does not
/// exist; every other failure is an error.
pub trait TunnelControl: Send + Sync {
    fn query_tunnel(&self, tunnel_id: u32) -> Result<Option<TunnelSpec>, LifecycleError>;
    fn create_tunnel(&self, spec: &TunnelSpec) -> Result<(), LifecycleError>;
    fn delete_tunnel(&self, tunnel_id: u32) -> Result<(), LifecycleError>;

    fn query_session(
        &self,
        tunnel_id: u32,
        session_id: u32,
    ) -> Result<Option<SessionSpec>, LifecycleError>;
    fn create_session(&self, spec: &SessionSpec) -> Result<(), LifecycleError>;
    fn delete_session(&self, tunnel_id: u32, session_id: u32) -> Result<(), LifecycleError>;

    fn query_interface(&self, name: &str) -> Result<Option<InterfaceState>, LifecycleError>;
    fn set_link(&self, name: &str, up: bool) -> Result<(), LifecycleError>;
    fn add_address(&self, name: &str, address: Ipv4Network) -> Result<(), LifecycleError>;
    fn flush_addresses(&self, name: &str) -> Result<(), LifecycleError>;
}
