//! Per-connection relay

use crate::stats::ListenerStats;
use crate::ForwardError;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Open the outbound leg, giving up after `timeout`
pub async fn connect(target: SocketAddrV4, timeout: Duration) -> Result<TcpStream, ForwardError> {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ForwardError::ForwardConnectFailure {
            target: target.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ForwardError::ForwardConnectFailure {
            target: target.to_string(),
            reason: format!("timed out after {:?}", timeout),
        }),
    }
}

/// Relay one accepted client to `target` until either side closes.
///
/// A failed outbound connect drops only this client.
pub(crate) async fn relay(
    mut client: TcpStream,
    peer: SocketAddr,
    target: SocketAddrV4,
    connect_timeout: Duration,
    stats: Arc<ListenerStats>,
) {
    let _active = stats.open_connection();

    let mut remote = match connect(target, connect_timeout).await {
        Ok(remote) => remote,
        Err(e) => {
            stats.record_error();
            warn!("Dropping connection from {}: {}", peer, e);
            return;
        }
    };
    let _ = remote.set_nodelay(true);

    match copy_bidirectional(&mut client, &mut remote).await {
        Ok((to_remote, to_client)) => {
            stats.add_bytes(to_remote, to_client);
            debug!(
                "Connection {} -> {} closed ({} bytes out, {} bytes back)",
                peer, target, to_remote, to_client
            );
        }
        Err(e) => {
            debug!("Connection {} -> {} ended: {}", peer, target, e);
        }
    }
}
