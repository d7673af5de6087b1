//! In-memory kernel model
//!
//! Mimics the kernel objects `ip l2tp` manages closely enough to exercise the
//! controller: creating a session creates its interface, deleting a session
//! removes it, deleting a tunnel removes its sessions.

use crate::{
    InterfaceState, LifecycleError, ModuleLoader, SessionSpec, TunnelControl, TunnelSpec,
};
use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Kernel {
    tunnels: BTreeMap<u32, TunnelSpec>,
    sessions: BTreeMap<(u32, u32), SessionSpec>,
    interfaces: BTreeMap<String, InterfaceState>,
    /// Number of create calls that succeeded
    creates: usize,
    /// Operation name that fails on its next call
    fail_on: Option<String>,
}

#[derive(Debug, Default)]
pub struct MemoryControl {
    kernel: Mutex<Kernel>,
}

impl MemoryControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `operation` (e.g. `"create_session"`) fail
    pub fn fail_next(&self, operation: &str) {
        self.lock().fail_on = Some(operation.to_string());
    }

    /// Insert a tunnel directly, as if created by someone else
    pub fn insert_tunnel(&self, spec: TunnelSpec) {
        self.lock().tunnels.insert(spec.tunnel_id, spec);
    }

    pub fn tunnel_count(&self) -> usize {
        self.lock().tunnels.len()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn create_count(&self) -> usize {
        self.lock().creates
    }

    pub fn interface(&self, name: &str) -> Option<InterfaceState> {
        self.lock().interfaces.get(name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Kernel> {
        self.kernel.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, operation: &str) -> Result<MutexGuard<'_, Kernel>, LifecycleError> {
        let mut kernel = self.lock();
        if kernel.fail_on.as_deref() == Some(operation) {
            kernel.fail_on = None;
            return Err(LifecycleError::Command {
                command: operation.to_string(),
                detail: "injected failure".to_string(),
            });
        }
        Ok(kernel)
    }
}

fn exists(what: String) -> LifecycleError {
    LifecycleError::Command {
        command: "memory".to_string(),
        detail: format!("{} already exists", what),
    }
}

fn missing(what: String) -> LifecycleError {
    LifecycleError::Command {
        command: "memory".to_string(),
        detail: format!("{} does not exist", what),
    }
}

impl TunnelControl for MemoryControl {
    fn query_tunnel(&self, tunnel_id: u32) -> Result<Option<TunnelSpec>, LifecycleError> {
        Ok(self.begin("query_tunnel")?.tunnels.get(&tunnel_id).cloned())
    }

    fn create_tunnel(&self, spec: &TunnelSpec) -> Result<(), LifecycleError> {
        let mut kernel = self.begin("create_tunnel")?;
        if kernel.tunnels.contains_key(&spec.tunnel_id) {
            return Err(exists(format!("tunnel {}", spec.tunnel_id)));
        }
        kernel.tunnels.insert(spec.tunnel_id, spec.clone());
        kernel.creates += 1;
        Ok(())
    }

    fn delete_tunnel(&self, tunnel_id: u32) -> Result<(), LifecycleError> {
        let mut kernel = self.begin("delete_tunnel")?;
        if kernel.tunnels.remove(&tunnel_id).is_none() {
            return Err(missing(format!("tunnel {}", tunnel_id)));
        }
        let orphaned: Vec<(u32, u32)> = kernel
            .sessions
            .keys()
            .filter(|(t, _)| *t == tunnel_id)
            .copied()
            .collect();
        for key in orphaned {
            if let Some(session) = kernel.sessions.remove(&key) {
                kernel.interfaces.remove(&session.interface);
            }
        }
        Ok(())
    }

    fn query_session(
        &self,
        tunnel_id: u32,
        session_id: u32,
    ) -> Result<Option<SessionSpec>, LifecycleError> {
        Ok(self
            .begin("query_session")?
            .sessions
            .get(&(tunnel_id, session_id))
            .cloned())
    }

    fn create_session(&self, spec: &SessionSpec) -> Result<(), LifecycleError> {
        let mut kernel = self.begin("create_session")?;
        if !kernel.tunnels.contains_key(&spec.tunnel_id) {
            return Err(missing(format!("tunnel {}", spec.tunnel_id)));
        }
        let key = (spec.tunnel_id, spec.session_id);
        if kernel.sessions.contains_key(&key) {
            return Err(exists(format!("session {}", spec.session_id)));
        }
        if kernel.interfaces.contains_key(&spec.interface) {
            return Err(exists(format!("interface {}", spec.interface)));
        }
        kernel.sessions.insert(key, spec.clone());
        kernel
            .interfaces
            .insert(spec.interface.clone(), InterfaceState::default());
        kernel.creates += 1;
        Ok(())
    }

    fn delete_session(&self, tunnel_id: u32, session_id: u32) -> Result<(), LifecycleError> {
        let mut kernel = self.begin("delete_session")?;
        let session = kernel
            .sessions
            .remove(&(tunnel_id, session_id))
            .ok_or_else(|| missing(format!("session {}", session_id)))?;
        kernel.interfaces.remove(&session.interface);
        Ok(())
    }

    fn query_interface(&self, name: &str) -> Result<Option<InterfaceState>, LifecycleError> {
        Ok(self.begin("query_interface")?.interfaces.get(name).cloned())
    }

    fn set_link(&self, name: &str, up: bool) -> Result<(), LifecycleError> {
        let mut kernel = self.begin("set_link")?;
        let interface = kernel
            .interfaces
            .get_mut(name)
            .ok_or_else(|| missing(format!("interface {}", name)))?;
        interface.up = up;
        Ok(())
    }

    fn add_address(&self, name: &str, address: Ipv4Network) -> Result<(), LifecycleError> {
        let mut kernel = self.begin("add_address")?;
        let interface = kernel
            .interfaces
            .get_mut(name)
            .ok_or_else(|| missing(format!("interface {}", name)))?;
        if interface.addresses.contains(&address) {
            return Err(exists(format!("address {}", address)));
        }
        interface.addresses.push(address);
        Ok(())
    }

    fn flush_addresses(&self, name: &str) -> Result<(), LifecycleError> {
        let mut kernel = self.begin("flush_addresses")?;
        let interface = kernel
            .interfaces
            .get_mut(name)
            .ok_or_else(|| missing(format!("interface {}", name)))?;
        interface.addresses.clear();
        Ok(())
    }
}

/// Module loader that records what it loaded
#[derive(Debug, Default)]
pub struct MemoryModules {
    loaded: Mutex<Vec<String>>,
    unavailable: BTreeSet<String>,
}

impl MemoryModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader on which `module` is missing
    pub fn without(module: &str) -> Self {
        Self {
            loaded: Mutex::new(Vec::new()),
            unavailable: [module.to_string()].into_iter().collect(),
        }
    }

    /// Every successful load call, in order
    pub fn loaded(&self) -> Vec<String> {
        self.loaded
            .lock()
            .map(|l| l.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

impl ModuleLoader for MemoryModules {
    fn load(&self, module: &str) -> Result<(), LifecycleError> {
        if self.unavailable.contains(module) {
            return Err(LifecycleError::ModuleLoad {
                module: module.to_string(),
                detail: format!("Module {} not found", module),
            });
        }
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.push(module.to_string());
        Ok(())
    }
}
