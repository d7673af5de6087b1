//! One listening socket and the connections it accepted

use crate::relay::relay;
use crate::stats::ListenerStats;
use crate::{ForwardConfig, ForwardError, ListenerKey};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// How long a stopping listener may take before it is aborted
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Running listener
pub(crate) struct ListenerHandle {
    pub target: SocketAddrV4,
    pub local_addr: SocketAddr,
    pub stats: Arc<ListenerStats>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Start accepting on an already bound socket
    pub fn spawn(
        key: ListenerKey,
        listener: TcpListener,
        target: SocketAddrV4,
        connect_timeout: Duration,
    ) -> Result<Self, ForwardError> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ForwardError::ListenerBindFailure {
                address: "unknown".to_string(),
                port: key.port,
                reason: e.to_string(),
            })?;
        let stats = Arc::new(ListenerStats::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!("Forwarding {} ({}) -> {}", key, local_addr, target);
        let task = tokio::spawn(accept_loop(
            key,
            listener,
            target,
            connect_timeout,
            stats.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            target,
            local_addr,
            stats,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Close the socket and every in-flight connection
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(STOP_GRACE, &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
            let _ = self.task.await;
        }
    }
}

async fn accept_loop(
    key: ListenerKey,
    listener: TcpListener,
    target: SocketAddrV4,
    connect_timeout: Duration,
    stats: Arc<ListenerStats>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted {} on {}", peer, key);
                    let _ = stream.set_nodelay(true);
                    connections.spawn(relay(stream, peer, target, connect_timeout, stats.clone()));
                }
                Err(e) => {
                    stats.record_error();
                    warn!("Accept failed on {}: {}", key, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
    info!("Stopped forwarding {}", key);
}

/// Bind a listening socket, retrying while the port is still held
/// (typically by a listener that is shutting down)
pub(crate) async fn bind_with_retry(
    addr: SocketAddr,
    config: &ForwardConfig,
) -> Result<TcpListener, ForwardError> {
    let attempts = config.bind_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match bind(addr) {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Bound {} on attempt {}/{}", addr, attempt, attempts);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < attempts => {
                warn!(
                    "Port {} is in use (attempt {}/{}), retrying in {:?}",
                    addr.port(),
                    attempt,
                    attempts,
                    config.bind_retry_delay
                );
                last_error = e.to_string();
                tokio::time::sleep(config.bind_retry_delay).await;
            }
            Err(e) => {
                last_error = e.to_string();
                break;
            }
        }
    }

    Err(ForwardError::ListenerBindFailure {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: last_error,
    })
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}
