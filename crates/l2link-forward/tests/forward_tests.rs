//! Forwarding tests on loopback
//!
//! Listeners bind 127.0.0.1 and forward to echo servers on other loopback
//! addresses (127.0.0.2, 127.0.0.3) using the same port, mirroring how a
//! tunnel forwards to `remote_forward_ip:port`.

use chrono::Utc;
use l2link_forward::{ForwardConfig, ForwardingDaemon, ListenerKey, ListenerState};
use l2link_proto::{Side, TunnelRecord, RECORD_VERSION};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn config() -> ForwardConfig {
    ForwardConfig {
        listen_address: Ipv4Addr::LOCALHOST,
        connect_timeout: Duration::from_secs(2),
        bind_attempts: 1,
        bind_retry_delay: Duration::from_millis(10),
    }
}

/// A port that is currently free on 127.0.0.1
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn record(name: &str, ports: &[u16], remote: &str) -> TunnelRecord {
    TunnelRecord {
        version: RECORD_VERSION,
        name: name.to_string(),
        side: Side::A,
        local_public_ip: "203.0.113.10".parse().unwrap(),
        remote_public_ip: "198.51.100.20".parse().unwrap(),
        interface_ip: "10.30.0.1/30".parse().unwrap(),
        remote_forward_ip: remote.parse().unwrap(),
        tunnel_id: 1000,
        peer_tunnel_id: 2000,
        session_id: 10,
        peer_session_id: 20,
        interface_index: 0,
        forwarded_ports: ports.to_vec(),
        created_at: Utc::now(),
    }
}

/// Echo server bound to `ip:port`
async fn echo_server(ip: &str, port: u16) -> JoinHandle<()> {
    let addr: SocketAddr = format!("{}:{}", ip, port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    })
}

async fn round_trip(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

#[tokio::test]
async fn test_reconcile_opens_and_closes_exact_listeners() {
    let daemon = ForwardingDaemon::new(config());
    let (p80, p443, p22) = (free_port(), free_port(), free_port());

    let records = vec![
        record("t1", &[p80, p443], "127.0.0.2"),
        record("t2", &[p22], "127.0.0.2"),
    ];
    let report = daemon.reconcile(&records).await;
    assert_eq!(report.started.len(), 3);
    assert!(report.failures.is_empty());

    let records = vec![
        record("t1", &[p80], "127.0.0.2"),
        record("t2", &[p22], "127.0.0.2"),
    ];
    let report = daemon.reconcile(&records).await;
    assert_eq!(report.stopped, vec![ListenerKey::new("t1", p443)]);
    assert!(report.started.is_empty());
    assert_eq!(report.unchanged.len(), 2);

    // The closed port no longer accepts
    assert!(TcpStream::connect(("127.0.0.1", p443)).await.is_err());

    let status = daemon.status().await;
    assert_eq!(status.len(), 2);
    assert!(status.iter().all(|s| s.state == ListenerState::Listening));

    daemon.shutdown().await;
    assert!(daemon.status().await.is_empty());
}

#[tokio::test]
async fn test_relays_bytes_and_counts_them() {
    let daemon = ForwardingDaemon::new(config());
    let port = free_port();
    let _echo = echo_server("127.0.0.2", port).await;

    daemon
        .reconcile(&[record("t1", &[port], "127.0.0.2")])
        .await;
    assert_eq!(round_trip(port, b"hello tunnel").await, b"hello tunnel");

    // Byte counters land once the relay finishes
    let mut stats = daemon.status().await[0].stats.clone();
    for _ in 0..50 {
        if stats.active_connections == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        stats = daemon.status().await[0].stats.clone();
    }
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.bytes_to_remote, 12);
    assert_eq!(stats.bytes_to_client, 12);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_remote_drops_only_that_client() {
    let daemon = ForwardingDaemon::new(config());
    let port = free_port();

    daemon
        .reconcile(&[record("t1", &[port], "127.0.0.3")])
        .await;

    // Nothing listens on 127.0.0.3 yet: the client is closed
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    // The listener keeps accepting once the remote comes up
    let _echo = echo_server("127.0.0.3", port).await;
    assert_eq!(round_trip(port, b"again").await, b"again");

    let status = daemon.status().await;
    assert_eq!(status[0].stats.errors, 1);
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_bind_failure_is_per_port() {
    let daemon = ForwardingDaemon::new(config());
    let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let busy_port = busy.local_addr().unwrap().port();
    let free = free_port();

    let report = daemon
        .reconcile(&[record("t1", &[busy_port, free], "127.0.0.2")])
        .await;
    assert_eq!(report.started, vec![ListenerKey::new("t1", free)]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key, ListenerKey::new("t1", busy_port));
    assert_eq!(report.failures[0].kind, "listener_bind_failure");

    let status = daemon.status().await;
    let failed = status.iter().find(|s| s.port == busy_port).unwrap();
    assert_eq!(failed.state, ListenerState::Failed);
    assert!(failed.error.is_some());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_changed_target_restarts_listener() {
    let daemon = ForwardingDaemon::new(config());
    let port = free_port();

    daemon
        .reconcile(&[record("t1", &[port], "127.0.0.2")])
        .await;
    let report = daemon
        .reconcile(&[record("t1", &[port], "127.0.0.3")])
        .await;

    let key = ListenerKey::new("t1", port);
    assert_eq!(report.stopped, vec![key.clone()]);
    assert_eq!(report.started, vec![key]);
    assert_eq!(daemon.status().await[0].target, format!("127.0.0.3:{}", port));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_in_flight_connections() {
    let daemon = ForwardingDaemon::new(config());
    let port = free_port();
    let _echo = echo_server("127.0.0.2", port).await;

    daemon
        .reconcile(&[record("t1", &[port], "127.0.0.2")])
        .await;
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    timeout(Duration::from_secs(5), daemon.shutdown())
        .await
        .unwrap();

    let read = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}
