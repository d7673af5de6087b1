//! Tunnel lifecycle state machine
//!
//! ```text
//! ABSENT -> TUNNEL_CREATED -> SESSION_CREATED -> INTERFACE_UP
//! ```
//!
//! The current state is always observed from the OS, never cached. `apply`
//! walks forward from wherever the kernel is, `teardown` walks back. A failed
//! transition is reported as a conflict and nothing is rolled back.

use crate::{
    LifecycleError, ModuleLoader, SessionSpec, Stage, TunnelControl, TunnelSpec,
};
use l2link_proto::{TunnelRecord, REQUIRED_MODULES};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observed kernel state of one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KernelState {
    Absent,
    TunnelCreated,
    SessionCreated,
    InterfaceUp,
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KernelState::Absent => "ABSENT",
            KernelState::TunnelCreated => "TUNNEL_CREATED",
            KernelState::SessionCreated => "SESSION_CREATED",
            KernelState::InterfaceUp => "INTERFACE_UP",
        };
        f.write_str(name)
    }
}

pub struct LifecycleController {
    control: Arc<dyn TunnelControl>,
    modules: Arc<dyn ModuleLoader>,
    prepared: AtomicBool,
}

impl LifecycleController {
    pub fn new(control: Arc<dyn TunnelControl>, modules: Arc<dyn ModuleLoader>) -> Self {
        Self {
            control,
            modules,
            prepared: AtomicBool::new(false),
        }
    }

    /// Load the L2TP kernel modules, once per controller
    pub fn prepare(&self) -> Result<(), LifecycleError> {
        if self.prepared.load(Ordering::Acquire) {
            return Ok(());
        }
        for module in REQUIRED_MODULES {
            self.modules.load(module)?;
        }
        self.prepared.store(true, Ordering::Release);
        info!("Kernel modules loaded: {}", REQUIRED_MODULES.join(", "));
        Ok(())
    }

    /// Current kernel state of a tunnel.
    ///
    /// Objects that exist with parameters other than the record's are a
    /// conflict, not a lower state.
    pub fn observe(&self, record: &TunnelRecord) -> Result<KernelState, LifecycleError> {
        let tunnel = TunnelSpec::for_record(record);
        match self.control.query_tunnel(record.tunnel_id)? {
            None => return Ok(KernelState::Absent),
            Some(found) if found != tunnel => {
                return Err(LifecycleError::conflict(
                    Stage::Observe,
                    format!(
                        "tunnel {} exists as {} -> {} peer {}, record wants {} -> {} peer {}",
                        found.tunnel_id,
                        found.local,
                        found.remote,
                        found.peer_tunnel_id,
                        tunnel.local,
                        tunnel.remote,
                        tunnel.peer_tunnel_id
                    ),
                ))
            }
            Some(_) => {}
        }

        let session = SessionSpec::for_record(record);
        match self
            .control
            .query_session(record.tunnel_id, record.session_id)?
        {
            None => return Ok(KernelState::TunnelCreated),
            Some(found)
                if found.peer_session_id != session.peer_session_id
                    || (!found.interface.is_empty() && found.interface != session.interface) =>
            {
                return Err(LifecycleError::conflict(
                    Stage::Observe,
                    format!(
                        "session {} exists with peer session {} on {}, record wants {} on {}",
                        found.session_id,
                        found.peer_session_id,
                        found.interface,
                        session.peer_session_id,
                        session.interface
                    ),
                ))
            }
            Some(_) => {}
        }

        let Some(interface) = self.control.query_interface(&session.interface)? else {
            return Ok(KernelState::SessionCreated);
        };
        if let Some(foreign) = interface
            .addresses
            .iter()
            .find(|a| **a != record.interface_ip)
        {
            return Err(LifecycleError::conflict(
                Stage::Observe,
                format!(
                    "interface {} carries address {}, record wants {}",
                    session.interface, foreign, record.interface_ip
                ),
            ));
        }
        if interface.up && interface.addresses.contains(&record.interface_ip) {
            Ok(KernelState::InterfaceUp)
        } else {
            Ok(KernelState::SessionCreated)
        }
    }

    /// Drive a tunnel to `INTERFACE_UP`; a no-op when it is already there
    pub fn apply(&self, record: &TunnelRecord) -> Result<KernelState, LifecycleError> {
        self.prepare()?;

        let state = self.observe(record)?;
        if state == KernelState::InterfaceUp {
            debug!("Tunnel '{}' already up", record.name);
            return Ok(state);
        }

        if state == KernelState::Absent {
            let spec = TunnelSpec::for_record(record);
            self.control
                .create_tunnel(&spec)
                .map_err(|e| LifecycleError::conflict(Stage::CreateTunnel, e.to_string()))?;
            info!(
                "Tunnel '{}': created L2TP tunnel {} ({} -> {})",
                record.name, spec.tunnel_id, spec.local, spec.remote
            );
        }

        let session = SessionSpec::for_record(record);
        if state <= KernelState::TunnelCreated {
            self.control
                .create_session(&session)
                .map_err(|e| LifecycleError::conflict(Stage::CreateSession, e.to_string()))?;
            info!(
                "Tunnel '{}': created session {} on {}",
                record.name, session.session_id, session.interface
            );
        }

        let interface = self
            .control
            .query_interface(&session.interface)
            .map_err(|e| LifecycleError::conflict(Stage::BringUp, e.to_string()))?
            .ok_or_else(|| {
                LifecycleError::conflict(
                    Stage::BringUp,
                    format!("interface {} does not exist", session.interface),
                )
            })?;
        if !interface.up {
            self.control
                .set_link(&session.interface, true)
                .map_err(|e| LifecycleError::conflict(Stage::BringUp, e.to_string()))?;
        }
        if !interface.addresses.contains(&record.interface_ip) {
            self.control
                .add_address(&session.interface, record.interface_ip)
                .map_err(|e| LifecycleError::conflict(Stage::BringUp, e.to_string()))?;
        }
        info!(
            "Tunnel '{}': {} up with {}",
            record.name, session.interface, record.interface_ip
        );

        Ok(KernelState::InterfaceUp)
    }

    /// Remove a tunnel's kernel objects; a no-op when nothing exists
    pub fn teardown(&self, record: &TunnelRecord) -> Result<KernelState, LifecycleError> {
        let state = self.observe(record)?;
        let teardown = |e: LifecycleError| LifecycleError::conflict(Stage::Teardown, e.to_string());

        if state >= KernelState::SessionCreated {
            let interface = record.interface_name();
            if self.control.query_interface(&interface).map_err(teardown)?.is_some() {
                if let Err(e) = self.control.flush_addresses(&interface) {
                    warn!("Tunnel '{}': flushing {} failed: {}", record.name, interface, e);
                }
                if let Err(e) = self.control.set_link(&interface, false) {
                    warn!("Tunnel '{}': setting {} down failed: {}", record.name, interface, e);
                }
            }
            self.control
                .delete_session(record.tunnel_id, record.session_id)
                .map_err(teardown)?;
            info!("Tunnel '{}': deleted session {}", record.name, record.session_id);
        }

        if state >= KernelState::TunnelCreated {
            self.control
                .delete_tunnel(record.tunnel_id)
                .map_err(teardown)?;
            info!("Tunnel '{}': deleted L2TP tunnel {}", record.name, record.tunnel_id);
        }

        Ok(KernelState::Absent)
    }
}
