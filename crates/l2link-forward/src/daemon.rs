//! Forwarding daemon
//!
//! Owns the map from `(tunnel, port)` to listener. Every reconcile pass
//! recomputes the desired listener set from the full record list, stops what
//! is no longer wanted (or whose target moved), starts what is missing and
//! leaves everything else running.

use crate::listener::{bind_with_retry, ListenerHandle};
use crate::stats::StatsSnapshot;
use crate::{ForwardConfig, ForwardError, ListenerKey};
use futures::future::join_all;
use l2link_proto::TunnelRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{SocketAddr, SocketAddrV4};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Outcome of one reconcile pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub started: Vec<ListenerKey>,
    pub stopped: Vec<ListenerKey>,
    pub unchanged: Vec<ListenerKey>,
    pub failures: Vec<ListenerFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerFailure {
    pub key: ListenerKey,
    pub target: String,
    /// Taxonomy name of the error, e.g. `listener_bind_failure`
    pub kind: String,
    pub reason: String,
}

impl ListenerFailure {
    fn new(key: ListenerKey, target: SocketAddrV4, error: &ForwardError) -> Self {
        Self {
            key,
            target: target.to_string(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Listening,
    Failed,
}

/// Status of one desired listener, running or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerStatus {
    pub tunnel: String,
    pub port: u16,
    pub target: String,
    pub state: ListenerState,
    pub local_address: Option<String>,
    pub error: Option<String>,
    pub stats: StatsSnapshot,
}

#[derive(Default)]
struct State {
    listeners: BTreeMap<ListenerKey, ListenerHandle>,
    failures: BTreeMap<ListenerKey, ListenerFailure>,
}

pub struct ForwardingDaemon {
    config: ForwardConfig,
    state: Mutex<State>,
}

impl ForwardingDaemon {
    pub fn new(config: ForwardConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    /// Bring the running listeners in line with `records`
    pub async fn reconcile(&self, records: &[TunnelRecord]) -> ReconcileReport {
        let (desired, contested) = desired_listeners(records);
        let mut state = self.state.lock().await;
        let mut report = ReconcileReport::default();
        state.failures.clear();

        let stale: Vec<ListenerKey> = state
            .listeners
            .iter()
            .filter(|(key, handle)| desired.get(*key) != Some(&handle.target))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(handle) = state.listeners.remove(&key) {
                handle.stop().await;
                report.stopped.push(key);
            }
        }

        for (key, target) in desired {
            if state.listeners.contains_key(&key) {
                report.unchanged.push(key);
                continue;
            }

            let addr = SocketAddr::new(self.config.listen_address.into(), key.port);
            let started = match bind_with_retry(addr, &self.config).await {
                Ok(listener) => ListenerHandle::spawn(
                    key.clone(),
                    listener,
                    target,
                    self.config.connect_timeout,
                ),
                Err(e) => Err(e),
            };
            match started {
                Ok(handle) => {
                    state.listeners.insert(key.clone(), handle);
                    report.started.push(key);
                }
                Err(e) => {
                    error!("Listener {} failed: {}", key, e);
                    let failure = ListenerFailure::new(key.clone(), target, &e);
                    state.failures.insert(key, failure.clone());
                    report.failures.push(failure);
                }
            }
        }

        for failure in contested {
            warn!("Listener {} not started: {}", failure.key, failure.reason);
            state.failures.insert(failure.key.clone(), failure.clone());
            report.failures.push(failure);
        }

        info!(
            "Reconciled forwarding: {} started, {} stopped, {} unchanged, {} failed",
            report.started.len(),
            report.stopped.len(),
            report.unchanged.len(),
            report.failures.len()
        );
        report
    }

    /// Every listener from the last reconcile, sorted by tunnel then port
    pub async fn status(&self) -> Vec<ListenerStatus> {
        let state = self.state.lock().await;
        let mut status: BTreeMap<&ListenerKey, ListenerStatus> = BTreeMap::new();

        for (key, handle) in &state.listeners {
            status.insert(
                key,
                ListenerStatus {
                    tunnel: key.tunnel.clone(),
                    port: key.port,
                    target: handle.target.to_string(),
                    state: ListenerState::Listening,
                    local_address: Some(handle.local_addr.to_string()),
                    error: None,
                    stats: handle.stats.snapshot(),
                },
            );
        }
        for (key, failure) in &state.failures {
            status.insert(
                key,
                ListenerStatus {
                    tunnel: key.tunnel.clone(),
                    port: key.port,
                    target: failure.target.clone(),
                    state: ListenerState::Failed,
                    local_address: None,
                    error: Some(failure.reason.clone()),
                    stats: StatsSnapshot::default(),
                },
            );
        }

        status.into_values().collect()
    }

    /// Stop every listener and drop all in-flight connections
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let listeners = std::mem::take(&mut state.listeners);
        state.failures.clear();

        let count = listeners.len();
        join_all(listeners.into_values().map(ListenerHandle::stop)).await;
        info!("Forwarding stopped ({} listener(s) closed)", count);
    }
}

/// Desired `(tunnel, port) -> target` map, plus the pairs that lost a port
/// to another tunnel.
///
/// When several tunnels declare the same port, the most recently created one
/// (latest `created_at`, then greatest name) gets it.
fn desired_listeners(
    records: &[TunnelRecord],
) -> (BTreeMap<ListenerKey, SocketAddrV4>, Vec<ListenerFailure>) {
    let mut owners: BTreeMap<u16, &TunnelRecord> = BTreeMap::new();
    for record in records {
        for &port in &record.forwarded_ports {
            let owner = owners.entry(port).or_insert(record);
            if (record.created_at, &record.name) > (owner.created_at, &owner.name) {
                *owner = record;
            }
        }
    }

    let mut desired = BTreeMap::new();
    let mut contested = Vec::new();
    for record in records {
        for &port in &record.forwarded_ports {
            let key = ListenerKey::new(record.name.clone(), port);
            let target = SocketAddrV4::new(record.remote_forward_ip, port);
            match owners.get(&port) {
                Some(owner) if owner.name != record.name => {
                    let reason = ForwardError::ListenerBindFailure {
                        address: "*".to_string(),
                        port,
                        reason: format!("port is claimed by tunnel '{}'", owner.name),
                    };
                    contested.push(ListenerFailure::new(key, target, &reason));
                }
                _ => {
                    desired.insert(key, target);
                }
            }
        }
    }
    (desired, contested)
}
