//! Process-wide streaming metrics.
//!
//! A single `StreamMetrics` instance is created at startup and handed to the
//! multiplexer and every stream as a write-only sink. Counters are plain
//! atomics; snapshots feed the health endpoint, and notable transitions are
//! mirrored into structured log events.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default)]
pub struct StreamMetrics {
    streams_active: AtomicUsize,
    clients_active: AtomicUsize,
    reconnect_attempts: AtomicU64,
    reconnects: AtomicU64,
    reconnect_downtime_ms: AtomicU64,
    bytes_from_upstream: AtomicU64,
    clients_evicted: AtomicU64,
}

/// Point-in-time copy of the counters, for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub streams_active: usize,
    pub clients_active: usize,
    pub reconnect_attempts: u64,
    pub reconnects: u64,
    pub reconnect_downtime_ms: u64,
    pub bytes_from_upstream: u64,
    pub clients_evicted: u64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_streams_active(&self, count: usize) {
        self.streams_active.store(count, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        self.clients_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        let previous = self.clients_active.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "client count underflow");
    }

    pub fn client_evicted(&self) {
        self.clients_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self, downtime: Duration) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.reconnect_downtime_ms
            .fetch_add(downtime.as_millis() as u64, Ordering::Relaxed);
        info!(
            downtime_ms = downtime.as_millis() as u64,
            total_reconnects = self.reconnects.load(Ordering::Relaxed),
            "upstream reconnection recorded"
        );
    }

    pub fn add_upstream_bytes(&self, bytes: u64) {
        self.bytes_from_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            streams_active: self.streams_active.load(Ordering::Relaxed),
            clients_active: self.clients_active.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            reconnect_downtime_ms: self.reconnect_downtime_ms.load(Ordering::Relaxed),
            bytes_from_upstream: self.bytes_from_upstream.load(Ordering::Relaxed),
            clients_evicted: self.clients_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = StreamMetrics::new();
        metrics.set_streams_active(2);
        metrics.client_connected();
        metrics.client_connected();
        metrics.client_disconnected();
        metrics.reconnect_attempt();
        metrics.reconnected(Duration::from_millis(250));
        metrics.add_upstream_bytes(1024);
        metrics.client_evicted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.streams_active, 2);
        assert_eq!(snapshot.clients_active, 1);
        assert_eq!(snapshot.reconnect_attempts, 1);
        assert_eq!(snapshot.reconnects, 1);
        assert_eq!(snapshot.reconnect_downtime_ms, 250);
        assert_eq!(snapshot.bytes_from_upstream, 1024);
        assert_eq!(snapshot.clients_evicted, 1);
    }
}
