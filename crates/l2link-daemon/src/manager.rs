//! Management operations
//!
//! A [`Manager`] ties the registry, the lifecycle controller and (inside the
//! daemon) the forwarding daemon together, and answers [`IpcRequest`]s. The
//! CLI runs the same manager in-process when no daemon is reachable.

use crate::ipc::{HostStatus, IpcRequest, IpcResponse, LifecycleOutcome, TunnelStatus};
use anyhow::{anyhow, Result};
use l2link_forward::{ForwardError, ForwardingDaemon, ListenerStatus, ReconcileReport};
use l2link_lifecycle::{
    KernelState, LifecycleController, LifecycleError, SessionSpec, TunnelSpec,
};
use l2link_proto::{TunnelCandidate, TunnelRecord};
use l2link_registry::{RegistryError, TunnelRegistry};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub struct Manager {
    registry: Arc<TunnelRegistry>,
    controller: Arc<LifecycleController>,
    forwarder: Option<Arc<ForwardingDaemon>>,
    /// Held from the registry snapshot until the forwarder has applied it
    reconcile_lock: Mutex<()>,
}

impl Manager {
    pub fn new(registry: Arc<TunnelRegistry>, controller: Arc<LifecycleController>) -> Self {
        Self {
            registry,
            controller,
            forwarder: None,
            reconcile_lock: Mutex::new(()),
        }
    }

    /// Reconcile forwarding after every registry mutation
    pub fn with_forwarder(mut self, forwarder: Arc<ForwardingDaemon>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Answer one request. `Shutdown` is acknowledged here and acted on by the
    /// daemon's command loop.
    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,

            IpcRequest::ListTunnels => match self.registry.list() {
                Ok(records) => IpcResponse::Tunnels { records },
                Err(e) => registry_error(e),
            },

            IpcRequest::GetTunnel { name } => match self.registry.get(&name) {
                Ok(record) => IpcResponse::Tunnel { record },
                Err(e) => registry_error(e),
            },

            IpcRequest::CreateTunnel { candidate } => match self.create(candidate).await {
                Ok(record) => IpcResponse::Tunnel { record },
                Err(e) => registry_error(e),
            },

            IpcRequest::UpdateTunnel { name, candidate } => {
                match self.update(&name, candidate).await {
                    Ok(record) => IpcResponse::Tunnel { record },
                    Err(e) => error_response(e),
                }
            }

            IpcRequest::DeleteTunnel { name, force } => match self.delete(&name, force).await {
                Ok(record) => IpcResponse::Ok {
                    message: Some(format!("Tunnel '{}' deleted", record.name)),
                },
                Err(e) => error_response(e),
            },

            IpcRequest::AddPorts { name, ports } => {
                match self.registry.add_ports(&name, &ports) {
                    Ok(record) => {
                        self.refresh_forwarding().await;
                        IpcResponse::Tunnel { record }
                    }
                    Err(e) => registry_error(e),
                }
            }

            IpcRequest::RemovePorts { name, ports } => {
                match self.registry.remove_ports(&name, &ports) {
                    Ok(record) => {
                        self.refresh_forwarding().await;
                        IpcResponse::Tunnel { record }
                    }
                    Err(e) => registry_error(e),
                }
            }

            IpcRequest::Apply { name } => match self.targets(name.as_deref()) {
                Ok(records) => IpcResponse::Lifecycle {
                    results: self.apply_all(records).await,
                },
                Err(e) => registry_error(e),
            },

            IpcRequest::Teardown { name } => match self.targets(name.as_deref()) {
                Ok(records) => IpcResponse::Lifecycle {
                    results: self.teardown_all(records).await,
                },
                Err(e) => registry_error(e),
            },

            IpcRequest::Reconcile if self.forwarder.is_none() => IpcResponse::error(
                "daemon_not_running",
                "Daemon is not running; forwarding is not active",
            ),

            IpcRequest::Reconcile => match self.reconcile().await {
                Ok(report) => IpcResponse::Reconciled { report },
                Err(e) => error_response(e),
            },

            IpcRequest::Status => match self.status().await {
                Ok(status) => IpcResponse::Status { status },
                Err(e) => error_response(e),
            },

            IpcRequest::Shutdown => IpcResponse::Ok {
                message: Some("Daemon shutting down".to_string()),
            },
        }
    }

    pub async fn create(&self, candidate: TunnelCandidate) -> Result<TunnelRecord, RegistryError> {
        let record = self.registry.create(candidate)?;
        self.refresh_forwarding().await;
        Ok(record)
    }

    /// Update a record. Kernel objects built from the old parameters are torn
    /// down first and rebuilt afterwards if the tunnel was up.
    ///
    /// Forwarding follows the saved record even when the rebuild fails; the
    /// rebuild error is returned after that.
    pub async fn update(&self, name: &str, candidate: TunnelCandidate) -> Result<TunnelRecord> {
        let old = self.registry.get(name)?;
        let old_state = self.observe(&old).await.unwrap_or(KernelState::Absent);

        let record = self.registry.update(name, candidate)?;
        let kernel_changed = kernel_identity(&old) != kernel_identity(&record);

        let mut rebuilt = Ok(());
        if kernel_changed && old_state != KernelState::Absent {
            info!("Tunnel '{}' kernel parameters changed, rebuilding", name);
            if let Err(e) = self.teardown(&old).await {
                warn!("Tunnel '{}': tearing down old parameters failed: {}", name, e);
            }
            if old_state == KernelState::InterfaceUp {
                rebuilt = self.apply(&record).await.map(|_| ());
            }
        }

        self.refresh_forwarding().await;
        rebuilt.map_err(|e| {
            anyhow!(e).context(format!(
                "Tunnel '{}' was updated but could not be brought back up",
                name
            ))
        })?;
        Ok(record)
    }

    pub async fn delete(&self, name: &str, force: bool) -> Result<TunnelRecord> {
        let record = self.registry.get(name)?;
        if let Err(e) = self.teardown(&record).await {
            if !force {
                return Err(anyhow!(e).context(format!(
                    "Tunnel '{}' was not deleted; retry with --force to remove the record anyway",
                    name
                )));
            }
            warn!("Tunnel '{}': teardown failed, deleting anyway: {}", name, e);
        }
        let record = self.registry.delete(name)?;
        self.refresh_forwarding().await;
        Ok(record)
    }

    pub async fn apply(&self, record: &TunnelRecord) -> Result<KernelState, LifecycleError> {
        let controller = self.controller.clone();
        let record = record.clone();
        blocking(move || controller.apply(&record)).await
    }

    pub async fn teardown(&self, record: &TunnelRecord) -> Result<KernelState, LifecycleError> {
        let controller = self.controller.clone();
        let record = record.clone();
        blocking(move || controller.teardown(&record)).await
    }

    pub async fn observe(&self, record: &TunnelRecord) -> Result<KernelState, LifecycleError> {
        let controller = self.controller.clone();
        let record = record.clone();
        blocking(move || controller.observe(&record)).await
    }

    /// Apply every record; one tunnel's failure does not stop the others
    pub async fn apply_all(&self, records: Vec<TunnelRecord>) -> Vec<LifecycleOutcome> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let outcome = self.apply(&record).await;
            if let Err(e) = &outcome {
                error!("Tunnel '{}': apply failed: {}", record.name, e);
            }
            results.push(outcome_of(record.name, outcome));
        }
        results
    }

    pub async fn teardown_all(&self, records: Vec<TunnelRecord>) -> Vec<LifecycleOutcome> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let outcome = self.teardown(&record).await;
            if let Err(e) = &outcome {
                error!("Tunnel '{}': teardown failed: {}", record.name, e);
            }
            results.push(outcome_of(record.name, outcome));
        }
        results
    }

    /// Recompute forwarding listeners from the registry
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let forwarder = self
            .forwarder
            .as_ref()
            .ok_or_else(|| anyhow!("Daemon is not running; forwarding is not active"))?;
        let _guard = self.reconcile_lock.lock().await;
        let records = self.registry.list()?;
        Ok(forwarder.reconcile(&records).await)
    }

    pub async fn status(&self) -> Result<HostStatus> {
        let records = self.registry.list()?;
        let listeners = match &self.forwarder {
            Some(forwarder) => forwarder.status().await,
            None => Vec::new(),
        };

        let mut tunnels = Vec::with_capacity(records.len());
        for record in records {
            let (kernel_state, kernel_error) = match self.observe(&record).await {
                Ok(state) => (Some(state), None),
                Err(e) => (None, Some(e.to_string())),
            };
            let own: Vec<ListenerStatus> = listeners
                .iter()
                .filter(|l| l.tunnel == record.name)
                .cloned()
                .collect();
            tunnels.push(TunnelStatus {
                interface: record.interface_name(),
                interface_ip: record.interface_ip.to_string(),
                remote_forward_ip: record.remote_forward_ip.to_string(),
                forwarded_ports: record.forwarded_ports,
                name: record.name,
                side: record.side,
                kernel_state,
                kernel_error,
                listeners: own,
            });
        }

        Ok(HostStatus {
            daemon_running: self.forwarder.is_some(),
            tunnels,
            skipped: self.registry.skipped().to_vec(),
        })
    }

    fn targets(&self, name: Option<&str>) -> Result<Vec<TunnelRecord>, RegistryError> {
        match name {
            Some(name) => Ok(vec![self.registry.get(name)?]),
            None => self.registry.list(),
        }
    }

    async fn refresh_forwarding(&self) {
        if self.forwarder.is_none() {
            return;
        }
        if let Err(e) = self.reconcile().await {
            error!("Forwarding reconcile failed: {}", e);
        }
    }
}

/// Run a blocking lifecycle call off the async workers
async fn blocking<F>(f: F) -> Result<KernelState, LifecycleError>
where
    F: FnOnce() -> Result<KernelState, LifecycleError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| {
            Err(LifecycleError::Command {
                command: "lifecycle task".to_string(),
                detail: e.to_string(),
            })
        })
}

/// Parameters that shape kernel objects
fn kernel_identity(
    record: &TunnelRecord,
) -> (TunnelSpec, SessionSpec, ipnetwork::Ipv4Network) {
    (
        TunnelSpec::for_record(record),
        SessionSpec::for_record(record),
        record.interface_ip,
    )
}

fn outcome_of(name: String, outcome: Result<KernelState, LifecycleError>) -> LifecycleOutcome {
    match outcome {
        Ok(state) => LifecycleOutcome {
            name,
            state: Some(state),
            error: None,
        },
        Err(e) => LifecycleOutcome {
            name,
            state: None,
            error: Some(e.to_string()),
        },
    }
}

fn registry_error(e: RegistryError) -> IpcResponse {
    IpcResponse::error(e.kind(), e.to_string())
}

/// Flatten an error for IPC, keeping the taxonomy name of its root cause
fn error_response(e: anyhow::Error) -> IpcResponse {
    let kind = if let Some(e) = e.downcast_ref::<RegistryError>() {
        e.kind()
    } else if let Some(e) = e.downcast_ref::<LifecycleError>() {
        e.kind()
    } else if let Some(e) = e.downcast_ref::<ForwardError>() {
        e.kind()
    } else {
        "internal"
    };
    IpcResponse::error(kind, format!("{:#}", e))
}
