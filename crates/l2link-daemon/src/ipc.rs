//! IPC between the CLI and the daemon
//!
//! JSON messages, one per line, over a Unix domain socket. A connection may
//! carry any number of request/response pairs.

use anyhow::{Context, Result};
use l2link_forward::{ListenerStatus, ReconcileReport};
use l2link_lifecycle::KernelState;
use l2link_proto::{Side, TunnelCandidate, TunnelRecord};
use l2link_registry::SkippedRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// IPC request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Ping to check if daemon is alive
    Ping,

    ListTunnels,

    GetTunnel { name: String },

    CreateTunnel { candidate: TunnelCandidate },

    UpdateTunnel {
        name: String,
        candidate: TunnelCandidate,
    },

    /// Tear down kernel objects, then remove the record. With `force` the
    /// record is removed even if teardown fails.
    DeleteTunnel { name: String, force: bool },

    AddPorts { name: String, ports: Vec<u16> },

    RemovePorts { name: String, ports: Vec<u16> },

    /// Bring one tunnel (or every tunnel) to INTERFACE_UP
    Apply { name: Option<String> },

    /// Remove kernel objects of one tunnel (or every tunnel)
    Teardown { name: Option<String> },

    /// Recompute forwarding listeners from the registry
    Reconcile,

    Status,

    /// Shutdown the daemon (stops forwarding and exits)
    Shutdown,
}

/// IPC response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Pong,

    /// Success acknowledgment
    Ok { message: Option<String> },

    Tunnel { record: TunnelRecord },

    Tunnels { records: Vec<TunnelRecord> },

    /// Per-tunnel outcome of apply/teardown
    Lifecycle { results: Vec<LifecycleOutcome> },

    Reconciled { report: ReconcileReport },

    Status { status: HostStatus },

    /// Error response; `kind` names the failure class
    Error { kind: String, message: String },
}

impl IpcResponse {
    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        IpcResponse::Error {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleOutcome {
    pub name: String,
    /// State reached, when the operation succeeded
    pub state: Option<KernelState>,
    pub error: Option<String>,
}

/// Everything `status` shows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatus {
    pub daemon_running: bool,
    pub tunnels: Vec<TunnelStatus>,
    /// Persisted records that failed to load
    pub skipped: Vec<SkippedRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub name: String,
    pub side: Side,
    pub interface: String,
    pub interface_ip: String,
    pub remote_forward_ip: String,
    pub forwarded_ports: Vec<u16>,
    pub kernel_state: Option<KernelState>,
    pub kernel_error: Option<String>,
    pub listeners: Vec<ListenerStatus>,
}

/// IPC client for CLI to connect to daemon
pub struct IpcClient {
    stream: BufReader<UnixStream>,
}

impl IpcClient {
    /// Connect to the daemon socket
    pub async fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to daemon socket at {:?}", path))?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send a request and receive a response
    pub async fn request(&mut self, req: &IpcRequest) -> Result<IpcResponse> {
        let mut json = serde_json::to_string(req)?;
        json.push('\n');

        self.stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .context("Failed to send request")?;
        self.stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush request")?;

        let mut response_line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut response_line)
            .await
            .context("Failed to read response")?;
        if bytes_read == 0 {
            anyhow::bail!("Daemon closed the connection");
        }

        let response: IpcResponse =
            serde_json::from_str(&response_line).context("Failed to parse response")?;
        Ok(response)
    }
}

/// IPC server for daemon to listen for CLI connections
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind to the daemon socket, replacing a stale socket file
    pub async fn bind_to(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => {
                    anyhow::bail!(
                        "Another daemon is already running (socket at {:?} is active)",
                        path
                    );
                }
                Err(_) => {
                    std::fs::remove_file(path)
                        .with_context(|| format!("Failed to remove stale socket {:?}", path))?;
                }
            }
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind to socket at {:?}", path))?;
        restrict_socket(path)?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<IpcConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcConnection {
            stream: BufReader::new(stream),
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// Only the owning account may talk to the daemon
fn restrict_socket(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {:?}", path))
}

/// A single IPC connection from a client
pub struct IpcConnection {
    stream: BufReader<UnixStream>,
}

impl IpcConnection {
    /// Receive the next request; `None` once the client hangs up
    pub async fn recv(&mut self) -> Result<Option<IpcRequest>> {
        let mut line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut line)
            .await
            .context("Failed to read request")?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request: IpcRequest = serde_json::from_str(&line).context("Failed to parse request")?;
        Ok(Some(request))
    }

    /// Send a response to the client
    pub async fn send(&mut self, response: &IpcResponse) -> Result<()> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .context("Failed to send response")?;
        self.stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush response")?;

        Ok(())
    }
}
