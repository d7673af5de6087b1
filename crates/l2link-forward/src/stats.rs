use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Live counters for one listener
#[derive(Debug, Default)]
pub struct ListenerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    bytes_to_remote: AtomicU64,
    bytes_to_client: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub bytes_to_remote: u64,
    pub bytes_to_client: u64,
    pub errors: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Count an accepted connection as active until the guard drops
    pub(crate) fn open_connection(self: &Arc<Self>) -> ActiveConnection {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveConnection(self.clone())
    }

    pub(crate) fn add_bytes(&self, to_remote: u64, to_client: u64) {
        self.bytes_to_remote.fetch_add(to_remote, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(to_client, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct ActiveConnection(Arc<ListenerStats>);

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_connection_guard() {
        let stats = Arc::new(ListenerStats::default());
        let first = stats.open_connection();
        let second = stats.open_connection();
        assert_eq!(stats.snapshot().active_connections, 2);

        drop(first);
        stats.add_bytes(10, 20);
        stats.record_error();
        drop(second);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.bytes_to_remote, 10);
        assert_eq!(snapshot.bytes_to_client, 20);
        assert_eq!(snapshot.errors, 1);
    }
}
