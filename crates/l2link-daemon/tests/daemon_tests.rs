//! Manager and daemon tests against the in-memory kernel

use ipnetwork::Ipv4Network;
use l2link_daemon::{
    Daemon, DaemonCommand, IpcClient, IpcRequest, IpcResponse, L2linkConfig, Manager,
};
use l2link_forward::{ForwardConfig, ForwardingDaemon, ListenerState};
use l2link_lifecycle::{
    InterfaceState, KernelState, LifecycleController, LifecycleError, MemoryControl,
    MemoryModules, SessionSpec, TunnelControl, TunnelSpec,
};
use l2link_proto::{Side, TunnelCandidate};
use l2link_registry::{AddressPool, FileStore, MemoryStore, TunnelRegistry};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn candidate(name: &str, remote: &str) -> TunnelCandidate {
    TunnelCandidate::new(
        name,
        Side::A,
        "203.0.113.10".parse().unwrap(),
        remote.parse().unwrap(),
    )
}

fn manager(control: Arc<MemoryControl>) -> Manager {
    let registry =
        TunnelRegistry::open(AddressPool::parse("10.30.0.0/16").unwrap(), Arc::new(MemoryStore::new()))
            .unwrap();
    let controller = LifecycleController::new(control, Arc::new(MemoryModules::new()));
    Manager::new(Arc::new(registry), Arc::new(controller))
}

fn forwarding_manager(control: Arc<MemoryControl>) -> (Arc<Manager>, Arc<ForwardingDaemon>) {
    let forwarder = Arc::new(ForwardingDaemon::new(ForwardConfig {
        listen_address: Ipv4Addr::LOCALHOST,
        connect_timeout: Duration::from_secs(1),
        bind_attempts: 1,
        bind_retry_delay: Duration::from_millis(10),
    }));
    let manager = manager(control).with_forwarder(forwarder.clone());
    (Arc::new(manager), forwarder)
}

fn free_port() -> u16 {
    free_ports(1)[0]
}

/// Distinct ports that are currently free on 127.0.0.1
fn free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<std::net::TcpListener> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect()
}

/// Kernel whose tunnel creation blocks until released, like a hung `ip`
struct StuckControl {
    inner: MemoryControl,
    entered: AtomicBool,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl TunnelControl for StuckControl {
    fn query_tunnel(&self, tunnel_id: u32) -> Result<Option<TunnelSpec>, LifecycleError> {
        self.inner.query_tunnel(tunnel_id)
    }

    fn create_tunnel(&self, spec: &TunnelSpec) -> Result<(), LifecycleError> {
        self.entered.store(true, Ordering::SeqCst);
        let _ = self.release.lock().unwrap().recv();
        self.inner.create_tunnel(spec)
    }

    fn delete_tunnel(&self, tunnel_id: u32) -> Result<(), LifecycleError> {
        self.inner.delete_tunnel(tunnel_id)
    }

    fn query_session(
        &self,
        tunnel_id: u32,
        session_id: u32,
    ) -> Result<Option<SessionSpec>, LifecycleError> {
        self.inner.query_session(tunnel_id, session_id)
    }

    fn create_session(&self, spec: &SessionSpec) -> Result<(), LifecycleError> {
        self.inner.create_session(spec)
    }

    fn delete_session(&self, tunnel_id: u32, session_id: u32) -> Result<(), LifecycleError> {
        self.inner.delete_session(tunnel_id, session_id)
    }

    fn query_interface(&self, name: &str) -> Result<Option<InterfaceState>, LifecycleError> {
        self.inner.query_interface(name)
    }

    fn set_link(&self, name: &str, up: bool) -> Result<(), LifecycleError> {
        self.inner.set_link(name, up)
    }

    fn add_address(&self, name: &str, address: Ipv4Network) -> Result<(), LifecycleError> {
        self.inner.add_address(name, address)
    }

    fn flush_addresses(&self, name: &str) -> Result<(), LifecycleError> {
        self.inner.flush_addresses(name)
    }
}

async fn connect(socket: &Path) -> IpcClient {
    for _ in 0..100 {
        if let Ok(client) = IpcClient::connect_to(socket).await {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daemon socket never came up");
}

#[tokio::test]
async fn test_create_apply_and_status_without_daemon() {
    let control = Arc::new(MemoryControl::new());
    let manager = manager(control.clone());

    let response = manager
        .handle(IpcRequest::CreateTunnel {
            candidate: candidate("edge", "198.51.100.20").with_ports([443]),
        })
        .await;
    let record = match response {
        IpcResponse::Tunnel { record } => record,
        other => panic!("unexpected response: {:?}", other),
    };
    assert_eq!(record.interface_ip.to_string(), "10.30.0.1/30");

    match manager.handle(IpcRequest::Apply { name: None }).await {
        IpcResponse::Lifecycle { results } => {
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].state, Some(KernelState::InterfaceUp));
        }
        other => panic!("unexpected response: {:?}", other),
    }
    assert!(control.interface("l2tpeth0").unwrap().up);

    match manager.handle(IpcRequest::Status).await {
        IpcResponse::Status { status } => {
            assert!(!status.daemon_running);
            assert_eq!(status.tunnels.len(), 1);
            assert_eq!(status.tunnels[0].kernel_state, Some(KernelState::InterfaceUp));
            assert!(status.tunnels[0].listeners.is_empty());
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_reconcile_requires_daemon() {
    let manager = manager(Arc::new(MemoryControl::new()));
    match manager.handle(IpcRequest::Reconcile).await {
        IpcResponse::Error { kind, .. } => assert_eq!(kind, "daemon_not_running"),
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_registry_errors_keep_their_kind() {
    let manager = manager(Arc::new(MemoryControl::new()));
    manager
        .create(candidate("edge", "198.51.100.20"))
        .await
        .unwrap();

    match manager
        .handle(IpcRequest::CreateTunnel {
            candidate: candidate("edge", "198.51.100.21"),
        })
        .await
    {
        IpcResponse::Error { kind, .. } => assert_eq!(kind, "duplicate_identifier"),
        other => panic!("unexpected response: {:?}", other),
    }

    match manager
        .handle(IpcRequest::GetTunnel {
            name: "missing".to_string(),
        })
        .await
    {
        IpcResponse::Error { kind, .. } => assert_eq!(kind, "not_found"),
        other => panic!("unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_update_rebuilds_running_tunnel() {
    let control = Arc::new(MemoryControl::new());
    let manager = manager(control.clone());
    let record = manager
        .create(candidate("edge", "198.51.100.20"))
        .await
        .unwrap();
    manager.apply(&record).await.unwrap();

    let updated = manager
        .update("edge", candidate("edge", "198.51.100.99"))
        .await
        .unwrap();
    assert_eq!(updated.remote_public_ip, "198.51.100.99".parse::<Ipv4Addr>().unwrap());
    assert_eq!(updated.tunnel_id, record.tunnel_id);

    assert_eq!(manager.observe(&updated).await.unwrap(), KernelState::InterfaceUp);
    assert_eq!(control.tunnel_count(), 1);
}

#[tokio::test]
async fn test_update_of_absent_tunnel_leaves_kernel_alone() {
    let control = Arc::new(MemoryControl::new());
    let manager = manager(control.clone());
    manager
        .create(candidate("edge", "198.51.100.20"))
        .await
        .unwrap();

    manager
        .update("edge", candidate("edge", "198.51.100.99"))
        .await
        .unwrap();
    assert_eq!(control.create_count(), 0);
}

#[tokio::test]
async fn test_delete_refuses_when_teardown_fails() {
    let control = Arc::new(MemoryControl::new());
    let manager = manager(control.clone());
    let record = manager
        .create(candidate("edge", "198.51.100.20"))
        .await
        .unwrap();
    manager.apply(&record).await.unwrap();

    control.fail_next("delete_session");
    match manager
        .handle(IpcRequest::DeleteTunnel {
            name: "edge".to_string(),
            force: false,
        })
        .await
    {
        IpcResponse::Error { kind, message } => {
            assert_eq!(kind, "lifecycle_conflict");
            assert!(message.contains("--force"));
        }
        other => panic!("unexpected response: {:?}", other),
    }
    assert!(manager.registry().get("edge").is_ok());

    control.fail_next("delete_session");
    match manager
        .handle(IpcRequest::DeleteTunnel {
            name: "edge".to_string(),
            force: true,
        })
        .await
    {
        IpcResponse::Ok { .. } => {}
        other => panic!("unexpected response: {:?}", other),
    }
    assert!(manager.registry().get("edge").is_err());
}

#[tokio::test]
async fn test_daemon_serves_socket_and_shuts_down() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("run").join("daemon.sock");
    let config = L2linkConfig {
        state_dir: temp.path().join("state"),
        listen_address: Ipv4Addr::LOCALHOST,
        connect_timeout_secs: 1,
        bind_attempts: 1,
        socket_path: socket.clone(),
        ..L2linkConfig::default()
    };

    let control = Arc::new(MemoryControl::new());
    let daemon = Daemon::new(config, control.clone(), Arc::new(MemoryModules::new())).unwrap();
    let (command_tx, command_rx) = mpsc::channel(8);
    let handle = tokio::spawn(daemon.run(command_tx, command_rx));

    let mut client = connect(&socket).await;
    assert!(matches!(
        client.request(&IpcRequest::Ping).await.unwrap(),
        IpcResponse::Pong
    ));

    let port = free_port();
    let response = client
        .request(&IpcRequest::CreateTunnel {
            candidate: candidate("edge", "198.51.100.20").with_ports([port]),
        })
        .await
        .unwrap();
    assert!(matches!(response, IpcResponse::Tunnel { .. }));
    assert!(temp.path().join("state/tunnels/edge.json").exists());

    client
        .request(&IpcRequest::Apply {
            name: Some("edge".to_string()),
        })
        .await
        .unwrap();

    match client.request(&IpcRequest::Status).await.unwrap() {
        IpcResponse::Status { status } => {
            assert!(status.daemon_running);
            let tunnel = &status.tunnels[0];
            assert_eq!(tunnel.kernel_state, Some(KernelState::InterfaceUp));
            assert_eq!(tunnel.listeners.len(), 1);
            assert_eq!(tunnel.listeners[0].port, port);
            assert_eq!(tunnel.listeners[0].state, ListenerState::Listening);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    assert!(matches!(
        client.request(&IpcRequest::Shutdown).await.unwrap(),
        IpcResponse::Ok { .. }
    ));
    timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_daemon_stops_on_command_channel() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("daemon.sock");
    let config = L2linkConfig {
        state_dir: temp.path().join("state"),
        listen_address: Ipv4Addr::LOCALHOST,
        socket_path: socket.clone(),
        ..L2linkConfig::default()
    };

    let daemon = Daemon::new(
        config,
        Arc::new(MemoryControl::new()),
        Arc::new(MemoryModules::new()),
    )
    .unwrap();
    let (command_tx, command_rx) = mpsc::channel(8);
    let handle = tokio::spawn(daemon.run(command_tx.clone(), command_rx));

    connect(&socket).await;
    command_tx.send(DaemonCommand::Reconcile).await.unwrap();
    command_tx.send(DaemonCommand::Shutdown).await.unwrap();

    timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_failed_rebuild_still_updates_forwarding() {
    let control = Arc::new(MemoryControl::new());
    let (manager, forwarder) = forwarding_manager(control.clone());
    let ports = free_ports(2);

    let record = manager
        .create(candidate("edge", "198.51.100.20").with_ports([ports[0]]))
        .await
        .unwrap();
    manager.apply(&record).await.unwrap();
    assert_eq!(forwarder.status().await.len(), 1);

    control.fail_next("create_tunnel");
    let err = manager
        .update(
            "edge",
            candidate("edge", "198.51.100.99").with_ports(ports.clone()),
        )
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("could not be brought back up"));

    let saved = manager.registry().get("edge").unwrap();
    let mut expected = ports.clone();
    expected.sort_unstable();
    assert_eq!(saved.forwarded_ports, expected);

    let listeners = forwarder.status().await;
    assert_eq!(listeners.len(), 2);
    assert!(listeners.iter().all(|l| l.state == ListenerState::Listening));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_all_get_listeners() {
    let (manager, forwarder) = forwarding_manager(Arc::new(MemoryControl::new()));
    let ports = free_ports(8);

    let tasks: Vec<_> = ports
        .iter()
        .enumerate()
        .map(|(i, &port)| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .create(candidate(&format!("t{}", i), "198.51.100.20").with_ports([port]))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let listeners = forwarder.status().await;
    assert_eq!(listeners.len(), ports.len());
    assert!(listeners.iter().all(|l| l.state == ListenerState::Listening));
    forwarder.shutdown().await;
}

#[tokio::test]
async fn test_stuck_apply_does_not_block_forwarding_or_socket() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("daemon.sock");
    let state_dir = temp.path().join("state");
    let port = free_port();

    {
        let store = FileStore::open(state_dir.join("tunnels")).unwrap();
        let registry = TunnelRegistry::open(
            AddressPool::parse(l2link_proto::DEFAULT_POOL).unwrap(),
            Arc::new(store),
        )
        .unwrap();
        registry
            .create(candidate("edge", "198.51.100.20").with_ports([port]))
            .unwrap();
    }

    let (release_tx, release_rx) = std_mpsc::channel();
    let control = Arc::new(StuckControl {
        inner: MemoryControl::new(),
        entered: AtomicBool::new(false),
        release: Mutex::new(release_rx),
    });
    let config = L2linkConfig {
        state_dir,
        listen_address: Ipv4Addr::LOCALHOST,
        bind_attempts: 1,
        socket_path: socket.clone(),
        apply_on_start: true,
        ..L2linkConfig::default()
    };
    let daemon = Daemon::new(config, control.clone(), Arc::new(MemoryModules::new())).unwrap();
    let (command_tx, command_rx) = mpsc::channel(8);
    let handle = tokio::spawn(daemon.run(command_tx, command_rx));

    for _ in 0..250 {
        if control.entered.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(control.entered.load(Ordering::SeqCst));

    let mut client = connect(&socket).await;
    assert!(matches!(
        client.request(&IpcRequest::Ping).await.unwrap(),
        IpcResponse::Pong
    ));
    match client.request(&IpcRequest::Status).await.unwrap() {
        IpcResponse::Status { status } => {
            let listeners = &status.tunnels[0].listeners;
            assert_eq!(listeners.len(), 1);
            assert_eq!(listeners[0].port, port);
            assert_eq!(listeners[0].state, ListenerState::Listening);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    release_tx.send(()).unwrap();
    client.request(&IpcRequest::Shutdown).await.unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
