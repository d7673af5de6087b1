//! Long-running host daemon
//!
//! Brings tunnels up on start, owns the forwarding listeners and serves the
//! control socket until told to stop.

use crate::config::L2linkConfig;
use crate::ipc::{IpcConnection, IpcRequest, IpcServer};
use crate::manager::Manager;
use anyhow::{Context, Result};
use l2link_forward::ForwardingDaemon;
use l2link_lifecycle::{LifecycleController, ModuleLoader, TunnelControl};
use l2link_registry::{FileStore, TunnelRegistry};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Daemon command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Recompute forwarding listeners from the registry
    Reconcile,
    /// Stop forwarding and exit
    Shutdown,
}

pub struct Daemon {
    config: L2linkConfig,
    manager: Arc<Manager>,
    forwarder: Arc<ForwardingDaemon>,
}

impl Daemon {
    /// Open the registry and wire the lifecycle and forwarding components
    pub fn new(
        config: L2linkConfig,
        control: Arc<dyn TunnelControl>,
        modules: Arc<dyn ModuleLoader>,
    ) -> Result<Self> {
        let store = FileStore::open(config.tunnels_dir())
            .with_context(|| format!("Failed to open tunnel store {:?}", config.tunnels_dir()))?;
        let registry = TunnelRegistry::open(config.address_pool()?, Arc::new(store))
            .context("Failed to load tunnel registry")?;
        for skipped in registry.skipped() {
            warn!("Skipped tunnel record {}: {}", skipped.source, skipped.reason);
        }

        let controller = Arc::new(LifecycleController::new(control, modules));
        let forwarder = Arc::new(ForwardingDaemon::new(config.forward_config()));
        let manager = Manager::new(Arc::new(registry), controller).with_forwarder(forwarder.clone());

        Ok(Self {
            config,
            manager: Arc::new(manager),
            forwarder,
        })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Run until a `Shutdown` command arrives (from `command_rx` or the
    /// control socket)
    pub async fn run(
        self,
        command_tx: mpsc::Sender<DaemonCommand>,
        mut command_rx: mpsc::Receiver<DaemonCommand>,
    ) -> Result<()> {
        info!("Daemon starting...");

        let server = IpcServer::bind_to(&self.config.socket_path).await?;
        info!("IPC server listening at {:?}", server.path());

        let records = self.manager.registry().list()?;
        info!("Found {} tunnel(s)", records.len());

        let report = self.manager.reconcile().await?;
        if !report.failures.is_empty() {
            warn!("{} listener(s) failed to start", report.failures.len());
        }

        let ipc_task = tokio::spawn(Self::run_ipc_server(
            server,
            self.manager.clone(),
            command_tx,
        ));

        // Kernel bring-up can block on `ip`; listeners and the socket are
        // already serving by now
        let apply_task = self.config.apply_on_start.then(|| {
            let manager = self.manager.clone();
            tokio::spawn(async move {
                let results = manager.apply_all(records).await;
                let failed = results.iter().filter(|r| r.error.is_some()).count();
                if failed > 0 {
                    warn!("{} tunnel(s) could not be brought up", failed);
                }
            })
        });

        info!("Daemon ready");

        while let Some(command) = command_rx.recv().await {
            match command {
                DaemonCommand::Reconcile => {
                    if let Err(e) = self.manager.reconcile().await {
                        error!("Reconcile failed: {}", e);
                    }
                }
                DaemonCommand::Shutdown => {
                    info!("Shutting down daemon...");
                    break;
                }
            }
        }

        if let Some(apply_task) = apply_task {
            apply_task.abort();
        }
        ipc_task.abort();
        let _ = ipc_task.await;
        self.forwarder.shutdown().await;

        info!("Daemon stopped");
        Ok(())
    }

    /// Accept CLI connections, one task per connection
    async fn run_ipc_server(
        server: IpcServer,
        manager: Arc<Manager>,
        command_tx: mpsc::Sender<DaemonCommand>,
    ) {
        loop {
            match server.accept().await {
                Ok(conn) => {
                    tokio::spawn(Self::serve_connection(
                        conn,
                        manager.clone(),
                        command_tx.clone(),
                    ));
                }
                Err(e) => {
                    error!("IPC accept error: {}", e);
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn serve_connection(
        mut conn: IpcConnection,
        manager: Arc<Manager>,
        command_tx: mpsc::Sender<DaemonCommand>,
    ) {
        loop {
            let request = match conn.recv().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!("IPC recv error: {}", e);
                    break;
                }
            };

            let shutdown = request == IpcRequest::Shutdown;
            let response = manager.handle(request).await;
            if let Err(e) = conn.send(&response).await {
                warn!("IPC send error: {}", e);
                break;
            }
            if shutdown {
                let _ = command_tx.send(DaemonCommand::Shutdown).await;
                break;
            }
        }
    }
}
