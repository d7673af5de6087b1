//! Multi-tunnel lifecycle tests against the in-memory kernel

use chrono::Utc;
use l2link_lifecycle::{KernelState, LifecycleController, MemoryControl, MemoryModules};
use l2link_proto::{Side, TunnelIds, TunnelRecord, RECORD_VERSION};
use std::sync::Arc;

fn record(name: &str, slot: u32) -> TunnelRecord {
    let ids = TunnelIds::for_slot(Side::A, slot);
    let base = slot * 4;
    TunnelRecord {
        version: RECORD_VERSION,
        name: name.to_string(),
        side: Side::A,
        local_public_ip: "203.0.113.10".parse().unwrap(),
        remote_public_ip: format!("198.51.100.{}", 20 + slot).parse().unwrap(),
        interface_ip: format!("10.30.0.{}/30", base + 1).parse().unwrap(),
        remote_forward_ip: format!("10.30.0.{}", base + 2).parse().unwrap(),
        tunnel_id: ids.tunnel_id,
        peer_tunnel_id: ids.peer_tunnel_id,
        session_id: ids.session_id,
        peer_session_id: ids.peer_session_id,
        interface_index: slot,
        forwarded_ports: Vec::new(),
        created_at: Utc::now(),
    }
}

#[test]
fn test_tunnels_are_independent() {
    let control = Arc::new(MemoryControl::new());
    let controller = LifecycleController::new(control.clone(), Arc::new(MemoryModules::new()));
    let first = record("first", 0);
    let second = record("second", 1);

    controller.apply(&first).unwrap();
    controller.apply(&second).unwrap();
    assert_eq!(control.tunnel_count(), 2);
    assert!(control.interface("l2tpeth1").unwrap().up);

    controller.teardown(&first).unwrap();
    assert_eq!(controller.observe(&first).unwrap(), KernelState::Absent);
    assert_eq!(
        controller.observe(&second).unwrap(),
        KernelState::InterfaceUp
    );
}

#[test]
fn test_side_b_peer_gets_mirrored_objects() {
    let control = Arc::new(MemoryControl::new());
    let controller = LifecycleController::new(control.clone(), Arc::new(MemoryModules::new()));

    let mut peer = record("peer", 0);
    let ids = TunnelIds::for_slot(Side::B, 0);
    peer.side = Side::B;
    peer.interface_ip = "10.30.0.2/30".parse().unwrap();
    peer.remote_forward_ip = "10.30.0.1".parse().unwrap();
    peer.tunnel_id = ids.tunnel_id;
    peer.peer_tunnel_id = ids.peer_tunnel_id;
    peer.session_id = ids.session_id;
    peer.peer_session_id = ids.peer_session_id;

    assert_eq!(controller.apply(&peer).unwrap(), KernelState::InterfaceUp);
    let interface = control.interface("l2tpeth0").unwrap();
    assert_eq!(interface.addresses, vec![peer.interface_ip]);
}
