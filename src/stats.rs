//! Statistics tracking for the relay server.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::transport::Protocol;

/// Atomic counters for accepted clients.
pub struct RelayStats {
    pub tcp_clients: AtomicU64,
    pub udp_clients: AtomicU64,
    /// Clients accepted after shutdown was requested and closed unhandled.
    pub late_dropped: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            tcp_clients: AtomicU64::new(0),
            udp_clients: AtomicU64::new(0),
            late_dropped: AtomicU64::new(0),
        }
    }

    pub fn record_accepted(&self, protocol: Protocol) {
        match protocol {
            Protocol::Tcp => self.tcp_clients.fetch_add(1, Ordering::Relaxed),
            Protocol::Udp => self.udp_clients.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_late_dropped(&self) {
        self.late_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            tcp_clients: self.tcp_clients.swap(0, Ordering::Relaxed),
            udp_clients: self.udp_clients.swap(0, Ordering::Relaxed),
            late_dropped: self.late_dropped.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub tcp_clients: u64,
    pub udp_clients: u64,
    pub late_dropped: u64,
}

/// Atomic counters for host resolution outcomes.
pub struct ResolverStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub failures: AtomicU64,
}

impl ResolverStats {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> ResolverStatsSnapshot {
        let hits = self.hits.swap(0, Ordering::Relaxed);
        let misses = self.misses.swap(0, Ordering::Relaxed);
        let failures = self.failures.swap(0, Ordering::Relaxed);

        let hit_ratio = if hits + misses > 0 {
            hits as f64 / (hits + misses) as f64
        } else {
            0.0
        };

        ResolverStatsSnapshot {
            hits,
            misses,
            failures,
            hit_ratio,
        }
    }
}

impl Default for ResolverStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
    pub hit_ratio: f64,
}
