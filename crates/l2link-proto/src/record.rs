//! Tunnel record schema
//!
//! A [`TunnelRecord`] is the fully-resolved, persisted description of one
//! tunnel. A [`TunnelCandidate`] is the user-supplied input the registry turns
//! into a record, with the allocatable fields left optional.

use crate::{ProtoError, LINK_PREFIX, MAX_INTERFACE_INDEX, RECORD_VERSION};
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// First tunnel id handed out to side A (side B mirrors it at 2000)
pub const TUNNEL_ID_BASE_A: u32 = 1000;
pub const TUNNEL_ID_BASE_B: u32 = 2000;
/// First session id handed out to side A (side B mirrors it at 20)
pub const SESSION_ID_BASE_A: u32 = 10;
pub const SESSION_ID_BASE_B: u32 = 20;

/// Which of the two tunnel endpoints a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    /// Owns host `.1` of the link subnet
    A,
    /// Owns host `.2` of the link subnet
    B,
}

impl Side {
    /// Offset of this side's host address from the subnet base
    pub fn host_offset(self) -> u32 {
        match self {
            Side::A => 1,
            Side::B => 2,
        }
    }

    pub fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

impl FromStr for Side {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" | "role_a" => Ok(Side::A),
            "b" | "role_b" => Ok(Side::B),
            _ => Err(ProtoError::InvalidSide(s.to_string())),
        }
    }
}

/// Record field named in uniqueness violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierField {
    Name,
    TunnelId,
    PeerTunnelId,
    SessionId,
    PeerSessionId,
    InterfaceIndex,
    InterfaceIp,
    Subnet,
    ForwardedPorts,
}

impl fmt::Display for IdentifierField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdentifierField::Name => "name",
            IdentifierField::TunnelId => "tunnel_id",
            IdentifierField::PeerTunnelId => "peer_tunnel_id",
            IdentifierField::SessionId => "session_id",
            IdentifierField::PeerSessionId => "peer_session_id",
            IdentifierField::InterfaceIndex => "interface_index",
            IdentifierField::InterfaceIp => "interface_ip",
            IdentifierField::Subnet => "subnet",
            IdentifierField::ForwardedPorts => "forwarded_ports",
        };
        f.write_str(name)
    }
}

/// The four protocol-level identifiers of a tunnel/session pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelIds {
    pub tunnel_id: u32,
    pub peer_tunnel_id: u32,
    pub session_id: u32,
    pub peer_session_id: u32,
}

impl TunnelIds {
    /// Identifiers for allocation slot `slot` on the given side.
    ///
    /// Both hosts derive mirrored ids from the same slot, so a tunnel created
    /// at slot `k` on side A pairs with slot `k` on side B.
    pub fn for_slot(side: Side, slot: u32) -> Self {
        let (tunnel, peer_tunnel, session, peer_session) = match side {
            Side::A => (
                TUNNEL_ID_BASE_A,
                TUNNEL_ID_BASE_B,
                SESSION_ID_BASE_A,
                SESSION_ID_BASE_B,
            ),
            Side::B => (
                TUNNEL_ID_BASE_B,
                TUNNEL_ID_BASE_A,
                SESSION_ID_BASE_B,
                SESSION_ID_BASE_A,
            ),
        };
        Self {
            tunnel_id: tunnel + slot,
            peer_tunnel_id: peer_tunnel + slot,
            session_id: session + slot,
            peer_session_id: peer_session + slot,
        }
    }

    /// The identifiers the opposite endpoint must be configured with
    pub fn mirrored(&self) -> Self {
        Self {
            tunnel_id: self.peer_tunnel_id,
            peer_tunnel_id: self.tunnel_id,
            session_id: self.peer_session_id,
            peer_session_id: self.session_id,
        }
    }

    /// Field/value pairs, in the order uniqueness is checked
    pub fn fields(&self) -> [(IdentifierField, u32); 4] {
        [
            (IdentifierField::TunnelId, self.tunnel_id),
            (IdentifierField::PeerTunnelId, self.peer_tunnel_id),
            (IdentifierField::SessionId, self.session_id),
            (IdentifierField::PeerSessionId, self.peer_session_id),
        ]
    }
}

/// Persisted tunnel record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelRecord {
    /// Schema version
    pub version: u32,
    /// Tunnel name (primary key, also the file name)
    pub name: String,
    pub side: Side,
    pub local_public_ip: Ipv4Addr,
    pub remote_public_ip: Ipv4Addr,
    /// This side's host address within its `/30`
    pub interface_ip: Ipv4Network,
    /// Address forwarded connections are relayed to
    pub remote_forward_ip: Ipv4Addr,
    pub tunnel_id: u32,
    pub peer_tunnel_id: u32,
    pub session_id: u32,
    pub peer_session_id: u32,
    pub interface_index: u32,
    /// Sorted, duplicate-free
    pub forwarded_ports: Vec<u16>,
    /// First creation time, preserved across updates
    pub created_at: DateTime<Utc>,
}

impl TunnelRecord {
    pub fn ids(&self) -> TunnelIds {
        TunnelIds {
            tunnel_id: self.tunnel_id,
            peer_tunnel_id: self.peer_tunnel_id,
            session_id: self.session_id,
            peer_session_id: self.peer_session_id,
        }
    }

    /// Base network of the link subnet (e.g. `10.30.0.0/30`)
    pub fn subnet(&self) -> Ipv4Network {
        // A /30 built from its own network address is always valid
        Ipv4Network::new(self.interface_ip.network(), self.interface_ip.prefix())
            .unwrap_or(self.interface_ip)
    }

    pub fn interface_name(&self) -> String {
        crate::interface_name(self.interface_index)
    }

    /// Check the record on its own: schema version, name, ports, addressing.
    ///
    /// Used when loading persisted records, where the file may have been edited
    /// by hand.
    pub fn check(&self) -> Result<(), ProtoError> {
        if self.version != RECORD_VERSION {
            return Err(ProtoError::UnsupportedVersion(self.version));
        }
        validate_name(&self.name)?;
        check_interface(self.interface_ip, self.side)?;
        if self.local_public_ip == self.remote_public_ip {
            return Err(ProtoError::SamePublicIp(self.local_public_ip.to_string()));
        }
        check_ids(&self.ids())?;
        check_interface_index(self.interface_index)?;
        // Hand-edited files may be unsorted; only duplicates and zero are fatal
        validate_ports(&self.forwarded_ports)?;
        Ok(())
    }
}

/// User input for creating or updating a tunnel
///
/// `None` fields are allocated by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelCandidate {
    pub name: String,
    pub side: Side,
    pub local_public_ip: Ipv4Addr,
    pub remote_public_ip: Ipv4Addr,
    #[serde(default)]
    pub interface_ip: Option<Ipv4Network>,
    #[serde(default)]
    pub remote_forward_ip: Option<Ipv4Addr>,
    /// Either all four identifiers or none
    #[serde(default)]
    pub ids: Option<TunnelIds>,
    #[serde(default)]
    pub interface_index: Option<u32>,
    #[serde(default)]
    pub forwarded_ports: Vec<u16>,
}

impl TunnelCandidate {
    pub fn new(
        name: impl Into<String>,
        side: Side,
        local_public_ip: Ipv4Addr,
        remote_public_ip: Ipv4Addr,
    ) -> Self {
        Self {
            name: name.into(),
            side,
            local_public_ip,
            remote_public_ip,
            interface_ip: None,
            remote_forward_ip: None,
            ids: None,
            interface_index: None,
            forwarded_ports: Vec::new(),
        }
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.forwarded_ports = ports.into_iter().collect();
        self
    }

    pub fn with_interface_ip(mut self, interface_ip: Ipv4Network) -> Self {
        self.interface_ip = Some(interface_ip);
        self
    }

    pub fn with_ids(mut self, ids: TunnelIds) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_interface_index(mut self, index: u32) -> Self {
        self.interface_index = Some(index);
        self
    }

    /// Checks that need no knowledge of other records
    pub fn check(&self) -> Result<(), ProtoError> {
        validate_name(&self.name)?;
        if self.local_public_ip == self.remote_public_ip {
            return Err(ProtoError::SamePublicIp(self.local_public_ip.to_string()));
        }
        if let Some(ids) = &self.ids {
            check_ids(ids)?;
        }
        if let Some(index) = self.interface_index {
            check_interface_index(index)?;
        }
        validate_ports(&self.forwarded_ports)?;
        Ok(())
    }
}

impl From<&TunnelRecord> for TunnelCandidate {
    fn from(record: &TunnelRecord) -> Self {
        Self {
            name: record.name.clone(),
            side: record.side,
            local_public_ip: record.local_public_ip,
            remote_public_ip: record.remote_public_ip,
            interface_ip: Some(record.interface_ip),
            remote_forward_ip: Some(record.remote_forward_ip),
            ids: Some(record.ids()),
            interface_index: Some(record.interface_index),
            forwarded_ports: record.forwarded_ports.clone(),
        }
    }
}

/// Validate tunnel name (alphanumeric, hyphens, underscores only)
pub fn validate_name(name: &str) -> Result<(), ProtoError> {
    if name.is_empty() {
        return Err(ProtoError::InvalidName {
            name: name.to_string(),
            reason: "name cannot be empty".to_string(),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ProtoError::InvalidName {
            name: name.to_string(),
            reason: "only alphanumeric characters, hyphens, and underscores are allowed"
                .to_string(),
        });
    }
    Ok(())
}

/// Validate a port list and return it sorted
pub fn validate_ports(ports: &[u16]) -> Result<Vec<u16>, ProtoError> {
    let mut sorted = ports.to_vec();
    sorted.sort_unstable();
    for (i, port) in sorted.iter().enumerate() {
        if *port == 0 {
            return Err(ProtoError::InvalidPort(0));
        }
        if i > 0 && sorted[i - 1] == *port {
            return Err(ProtoError::DuplicatePort(*port));
        }
    }
    Ok(sorted)
}

/// Parse a comma-separated port list such as `443,80,2053`
pub fn parse_port_list(input: &str) -> Result<Vec<u16>, ProtoError> {
    let mut ports = Vec::new();
    for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let value: u32 = entry
            .parse()
            .map_err(|_| ProtoError::InvalidPortEntry(entry.to_string()))?;
        if value == 0 || value > u16::MAX as u32 {
            return Err(ProtoError::InvalidPort(value));
        }
        ports.push(value as u16);
    }
    Ok(ports)
}

/// The slot must produce an interface name the kernel accepts
pub fn check_interface_index(index: u32) -> Result<(), ProtoError> {
    if index > MAX_INTERFACE_INDEX {
        return Err(ProtoError::InterfaceIndexTooLarge {
            index,
            max: MAX_INTERFACE_INDEX,
        });
    }
    Ok(())
}

/// Interface address must be a /30 host matching the side
pub fn check_interface(interface_ip: Ipv4Network, side: Side) -> Result<(), ProtoError> {
    if interface_ip.prefix() != LINK_PREFIX {
        return Err(ProtoError::InvalidPrefix {
            address: interface_ip.to_string(),
        });
    }
    let offset = u32::from(interface_ip.ip()) - u32::from(interface_ip.network());
    if offset != side.host_offset() {
        return Err(ProtoError::WrongHost {
            address: interface_ip.to_string(),
            side: side.to_string(),
        });
    }
    Ok(())
}

fn check_ids(ids: &TunnelIds) -> Result<(), ProtoError> {
    for (field, value) in ids.fields() {
        if value == 0 {
            return Err(ProtoError::ZeroIdentifier {
                field: field.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TunnelRecord {
        TunnelRecord {
            version: RECORD_VERSION,
            name: "edge-1".to_string(),
            side: Side::A,
            local_public_ip: "203.0.113.10".parse().unwrap(),
            remote_public_ip: "198.51.100.20".parse().unwrap(),
            interface_ip: "10.30.0.1/30".parse().unwrap(),
            remote_forward_ip: "10.30.0.2".parse().unwrap(),
            tunnel_id: 1000,
            peer_tunnel_id: 2000,
            session_id: 10,
            peer_session_id: 20,
            interface_index: 0,
            forwarded_ports: vec![80, 443],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("test").is_ok());
        assert!(validate_name("test-123").is_ok());
        assert!(validate_name("test_tunnel").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("test/path").is_err());
        assert!(validate_name("test..tunnel").is_err());
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!("A".parse::<Side>().unwrap(), Side::A);
        assert_eq!("role_b".parse::<Side>().unwrap(), Side::B);
        assert!("iran".parse::<Side>().is_err());
        assert_eq!(Side::A.peer(), Side::B);
    }

    #[test]
    fn test_slot_ids_mirror_between_sides() {
        let a = TunnelIds::for_slot(Side::A, 3);
        let b = TunnelIds::for_slot(Side::B, 3);
        assert_eq!(a.tunnel_id, 1003);
        assert_eq!(a.peer_session_id, 23);
        assert_eq!(a.mirrored(), b);
    }

    #[test]
    fn test_validate_ports() {
        assert_eq!(validate_ports(&[443, 80]).unwrap(), vec![80, 443]);
        assert_eq!(validate_ports(&[0]), Err(ProtoError::InvalidPort(0)));
        assert_eq!(
            validate_ports(&[22, 80, 22]),
            Err(ProtoError::DuplicatePort(22))
        );
    }

    #[test]
    fn test_parse_port_list() {
        assert_eq!(parse_port_list("443, 80,2053").unwrap(), vec![443, 80, 2053]);
        assert_eq!(parse_port_list("").unwrap(), Vec::<u16>::new());
        assert!(matches!(
            parse_port_list("80,http"),
            Err(ProtoError::InvalidPortEntry(_))
        ));
        assert_eq!(parse_port_list("70000"), Err(ProtoError::InvalidPort(70000)));
    }

    #[test]
    fn test_check_interface() {
        let a: Ipv4Network = "10.30.0.1/30".parse().unwrap();
        let b: Ipv4Network = "10.30.0.2/30".parse().unwrap();
        assert!(check_interface(a, Side::A).is_ok());
        assert!(check_interface(b, Side::B).is_ok());
        assert!(matches!(
            check_interface(b, Side::A),
            Err(ProtoError::WrongHost { .. })
        ));
        let wide: Ipv4Network = "10.30.0.1/24".parse().unwrap();
        assert!(matches!(
            check_interface(wide, Side::A),
            Err(ProtoError::InvalidPrefix { .. })
        ));
    }

    #[test]
    fn test_record_subnet_and_interface() {
        let record = record();
        assert_eq!(record.subnet().to_string(), "10.30.0.0/30");
        assert_eq!(record.interface_name(), "l2tpeth0");
        assert!(record.check().is_ok());
    }

    #[test]
    fn test_record_rejects_unknown_fields() {
        let mut value = serde_json::to_value(record()).unwrap();
        value["colour"] = serde_json::json!("blue");
        assert!(serde_json::from_value::<TunnelRecord>(value).is_err());
    }

    #[test]
    fn test_record_rejects_missing_fields() {
        let mut value = serde_json::to_value(record()).unwrap();
        value.as_object_mut().unwrap().remove("session_id");
        assert!(serde_json::from_value::<TunnelRecord>(value).is_err());
    }

    #[test]
    fn test_candidate_from_record_keeps_fields() {
        let record = record();
        let candidate = TunnelCandidate::from(&record);
        assert_eq!(candidate.ids, Some(record.ids()));
        assert_eq!(candidate.interface_ip, Some(record.interface_ip));
        assert!(candidate.check().is_ok());
    }

    #[test]
    fn test_interface_index_must_fit_interface_name() {
        assert!(check_interface_index(MAX_INTERFACE_INDEX).is_ok());
        assert_eq!(crate::interface_name(MAX_INTERFACE_INDEX).len(), 15);

        let candidate = TunnelCandidate::from(&record()).with_interface_index(100_000_000);
        assert_eq!(
            candidate.check(),
            Err(ProtoError::InterfaceIndexTooLarge {
                index: 100_000_000,
                max: MAX_INTERFACE_INDEX
            })
        );

        let mut record = record();
        record.interface_index = 100_000_000;
        assert!(record.check().is_err());
    }
}
