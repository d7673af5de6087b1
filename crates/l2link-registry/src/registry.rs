//! Tunnel identity registry
//!
//! The registry owns the in-memory view of every tunnel record and is the only
//! writer of the record store. All mutations run validate-then-persist under
//! one exclusive lock, so two concurrent creates can never both claim the same
//! subnet or identifier. Reads share the lock and hand out cloned snapshots.

use crate::pool::AddressPool;
use crate::store::{RecordStore, SkippedRecord};
use crate::RegistryError;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use l2link_proto::{
    check_interface, validate_ports, IdentifierField, Side, TunnelCandidate, TunnelIds,
    TunnelRecord, LINK_PREFIX, RECORD_VERSION,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

type Records = BTreeMap<String, TunnelRecord>;

pub struct TunnelRegistry {
    pool: AddressPool,
    store: Arc<dyn RecordStore>,
    records: RwLock<Records>,
    skipped: Vec<SkippedRecord>,
}

impl TunnelRegistry {
    /// Open the registry, reloading every persisted record.
    ///
    /// Records that fail to parse, or that collide with a record loaded
    /// before them, are skipped and reported through [`skipped`](Self::skipped).
    pub fn open(pool: AddressPool, store: Arc<dyn RecordStore>) -> Result<Self, RegistryError> {
        let report = store.load_all()?;
        let mut skipped = report.skipped;
        let mut records = Records::new();

        for record in report.records {
            if !pool.contains(record.subnet()) {
                skipped.push(SkippedRecord {
                    source: record.name.clone(),
                    reason: format!(
                        "subnet {} is outside address pool {}",
                        record.subnet(),
                        pool.network()
                    ),
                });
                continue;
            }
            let others: Vec<&TunnelRecord> = records.values().collect();
            if let Err(e) = check_unique(&record, &others) {
                warn!("Skipping tunnel record '{}': {}", record.name, e);
                skipped.push(SkippedRecord {
                    source: record.name.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
            records.insert(record.name.clone(), record);
        }

        info!(
            "Registry loaded {} tunnel(s), {} skipped",
            records.len(),
            skipped.len()
        );

        Ok(Self {
            pool,
            store,
            records: RwLock::new(records),
            skipped,
        })
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Records that could not be loaded at startup
    pub fn skipped(&self) -> &[SkippedRecord] {
        &self.skipped
    }

    /// All records, sorted by name
    pub fn list(&self) -> Result<Vec<TunnelRecord>, RegistryError> {
        let records = self.records.read().map_err(|_| RegistryError::Poisoned)?;
        Ok(records.values().cloned().collect())
    }

    pub fn get(&self, name: &str) -> Result<TunnelRecord, RegistryError> {
        let records = self.records.read().map_err(|_| RegistryError::Poisoned)?;
        records
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Validate, allocate and persist a new tunnel
    pub fn create(&self, candidate: TunnelCandidate) -> Result<TunnelRecord, RegistryError> {
        let mut records = self.records.write().map_err(|_| RegistryError::Poisoned)?;

        if records.contains_key(&candidate.name) {
            return Err(RegistryError::DuplicateIdentifier {
                field: IdentifierField::Name,
                value: candidate.name.clone(),
                owner: candidate.name,
            });
        }

        let record = self.resolve(&records, candidate, None)?;
        self.store.save(&record)?;
        info!(
            "Created tunnel '{}' (side {}, {} -> {})",
            record.name, record.side, record.interface_ip, record.remote_forward_ip
        );
        records.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    /// Replace an existing tunnel, re-validating against every other record.
    ///
    /// Omitted allocatable fields keep their current values: the subnet is
    /// kept (with the host adjusted if the side changes), identifiers are kept
    /// unless the side changes, and the interface slot is kept.
    pub fn update(
        &self,
        name: &str,
        candidate: TunnelCandidate,
    ) -> Result<TunnelRecord, RegistryError> {
        let mut records = self.records.write().map_err(|_| RegistryError::Poisoned)?;

        let existing = records
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if candidate.name != name {
            return Err(RegistryError::Validation(format!(
                "tunnel '{}' cannot be renamed to '{}'",
                name, candidate.name
            )));
        }

        let record = self.resolve(&records, candidate, Some(&existing))?;
        if record == existing {
            return Ok(record);
        }
        self.store.save(&record)?;
        info!("Updated tunnel '{}'", record.name);
        records.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    /// Remove a tunnel, freeing its subnet and identifiers.
    ///
    /// Kernel objects and forwarding listeners are left to their owners.
    pub fn delete(&self, name: &str) -> Result<TunnelRecord, RegistryError> {
        let mut records = self.records.write().map_err(|_| RegistryError::Poisoned)?;

        if !records.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        self.store.remove(name)?;
        info!("Deleted tunnel '{}'", name);
        records
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Add forwarded ports to a tunnel
    pub fn add_ports(&self, name: &str, ports: &[u16]) -> Result<TunnelRecord, RegistryError> {
        let mut records = self.records.write().map_err(|_| RegistryError::Poisoned)?;

        let mut record = records
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let added = validate_ports(ports).map_err(|e| RegistryError::from_proto(e, name))?;
        for port in added {
            if record.forwarded_ports.contains(&port) {
                return Err(RegistryError::DuplicateIdentifier {
                    field: IdentifierField::ForwardedPorts,
                    value: port.to_string(),
                    owner: name.to_string(),
                });
            }
            record.forwarded_ports.push(port);
        }
        record.forwarded_ports.sort_unstable();

        self.store.save(&record)?;
        info!(
            "Tunnel '{}' now forwards ports {:?}",
            name, record.forwarded_ports
        );
        records.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    /// Remove forwarded ports from a tunnel; ports it does not forward are ignored
    pub fn remove_ports(&self, name: &str, ports: &[u16]) -> Result<TunnelRecord, RegistryError> {
        let mut records = self.records.write().map_err(|_| RegistryError::Poisoned)?;

        let mut record = records
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let before = record.forwarded_ports.len();
        record.forwarded_ports.retain(|p| !ports.contains(p));
        if record.forwarded_ports.len() == before {
            return Ok(record);
        }

        self.store.save(&record)?;
        info!(
            "Tunnel '{}' now forwards ports {:?}",
            name, record.forwarded_ports
        );
        records.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    /// Turn a candidate into a complete record, allocating what is missing
    fn resolve(
        &self,
        records: &Records,
        candidate: TunnelCandidate,
        existing: Option<&TunnelRecord>,
    ) -> Result<TunnelRecord, RegistryError> {
        let name = candidate.name.clone();
        candidate
            .check()
            .map_err(|e| RegistryError::from_proto(e, &name))?;

        let side = candidate.side;
        let others: Vec<&TunnelRecord> = records.values().filter(|r| r.name != name).collect();

        let interface_ip = match (candidate.interface_ip, existing) {
            (Some(interface_ip), _) => {
                check_interface(interface_ip, side)
                    .map_err(|e| RegistryError::from_proto(e, &name))?;
                interface_ip
            }
            (None, Some(existing)) => AddressPool::host_for(existing.subnet(), side),
            (None, None) => {
                let subnet = self.pool.allocate(others.iter().map(|r| r.subnet()))?;
                AddressPool::host_for(subnet, side)
            }
        };
        let subnet = Ipv4Network::new(interface_ip.network(), LINK_PREFIX)
            .map_err(|e| RegistryError::Validation(e.to_string()))?;
        if !self.pool.contains(subnet) {
            return Err(RegistryError::Validation(format!(
                "interface address {} is outside address pool {}",
                interface_ip,
                self.pool.network()
            )));
        }

        let remote_forward_ip = candidate
            .remote_forward_ip
            .unwrap_or_else(|| AddressPool::peer_of(interface_ip, side));
        if remote_forward_ip == interface_ip.ip() {
            return Err(RegistryError::Validation(format!(
                "remote forward address {} is this side's own interface address",
                remote_forward_ip
            )));
        }

        let ids = match (candidate.ids, existing) {
            (Some(ids), _) => ids,
            (None, Some(existing)) if existing.side == side => existing.ids(),
            (None, _) => free_ids(&others, side)?,
        };

        let interface_index = candidate
            .interface_index
            .or(existing.map(|e| e.interface_index))
            .unwrap_or_else(|| free_interface_index(&others));

        let forwarded_ports = validate_ports(&candidate.forwarded_ports)
            .map_err(|e| RegistryError::from_proto(e, &name))?;

        let record = TunnelRecord {
            version: RECORD_VERSION,
            name,
            side,
            local_public_ip: candidate.local_public_ip,
            remote_public_ip: candidate.remote_public_ip,
            interface_ip,
            remote_forward_ip,
            tunnel_id: ids.tunnel_id,
            peer_tunnel_id: ids.peer_tunnel_id,
            session_id: ids.session_id,
            peer_session_id: ids.peer_session_id,
            interface_index,
            forwarded_ports,
            created_at: existing.map(|e| e.created_at).unwrap_or_else(Utc::now),
        };

        check_unique(&record, &others)?;
        Ok(record)
    }
}

/// Check a record against every other record on the host
fn check_unique(record: &TunnelRecord, others: &[&TunnelRecord]) -> Result<(), RegistryError> {
    for other in others {
        let duplicate = |field: IdentifierField, value: String| RegistryError::DuplicateIdentifier {
            field,
            value,
            owner: other.name.clone(),
        };

        if other.interface_ip.ip() == record.interface_ip.ip() {
            return Err(duplicate(
                IdentifierField::InterfaceIp,
                record.interface_ip.ip().to_string(),
            ));
        }
        if other.subnet() == record.subnet() {
            return Err(duplicate(
                IdentifierField::Subnet,
                record.subnet().to_string(),
            ));
        }
        for ((field, value), (_, other_value)) in
            record.ids().fields().into_iter().zip(other.ids().fields())
        {
            if value == other_value {
                return Err(duplicate(field, value.to_string()));
            }
        }
        if other.interface_index == record.interface_index {
            return Err(duplicate(
                IdentifierField::InterfaceIndex,
                record.interface_index.to_string(),
            ));
        }
    }
    Ok(())
}

/// Identifiers for the lowest slot whose four ids are all unused
fn free_ids(others: &[&TunnelRecord], side: Side) -> Result<TunnelIds, RegistryError> {
    let mut used: [HashSet<u32>; 4] = Default::default();
    for other in others {
        for (set, (_, value)) in used.iter_mut().zip(other.ids().fields()) {
            set.insert(value);
        }
    }

    // Each record blocks at most one slot per identifier field
    let max_slot = 4 * others.len() as u32;
    (0..=max_slot)
        .map(|slot| TunnelIds::for_slot(side, slot))
        .find(|ids| {
            used.iter()
                .zip(ids.fields())
                .all(|(set, (_, value))| !set.contains(&value))
        })
        .ok_or_else(|| RegistryError::Validation("no free tunnel identifier slot".to_string()))
}

fn free_interface_index(others: &[&TunnelRecord]) -> u32 {
    let used: HashSet<u32> = others.iter().map(|r| r.interface_index).collect();
    (0..).find(|index| !used.contains(index)).unwrap_or_default()
}
