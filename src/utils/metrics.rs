//! Observability and Metrics
//!
//! Counters describing the connection engine of one server. Each server owns
//! a [`Metrics`] instance and shares it with its connections.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    /// Sockets accepted by the listener
    pub connections_total: AtomicU64,
    /// Connections accepted and not yet closed
    pub connections_active: AtomicU64,
    /// Connections declined by the admission hook
    pub connections_rejected: AtomicU64,
    /// Packets framed by the protocol
    pub packets_received: AtomicU64,
    /// Packets handed to the message hook
    pub packets_dispatched: AtomicU64,
    /// Packets written to sockets (both write loops)
    pub packets_sent: AtomicU64,
    /// Bytes written to sockets
    pub bytes_sent: AtomicU64,
    /// Connections closed by the heartbeat monitor
    pub heartbeat_expired: AtomicU64,
    /// Connections ended by a fatal I/O or framing error
    pub connection_errors: AtomicU64,
    /// Loops that panicked and were recovered
    pub loop_panics: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_dispatched: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            heartbeat_expired: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            loop_panics: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_accepted(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_dispatched(&self) {
        self.packets_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn heartbeat_expiry(&self) {
        self.heartbeat_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn loop_panic(&self) {
        self.loop_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dispatched: self.packets_dispatched.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            heartbeat_expired: self.heartbeat_expired.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            loop_panics: self.loop_panics.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_rejected = snapshot.connections_rejected,
            packets_received = snapshot.packets_received,
            packets_dispatched = snapshot.packets_dispatched,
            packets_sent = snapshot.packets_sent,
            bytes_sent = snapshot.bytes_sent,
            heartbeat_expired = snapshot.heartbeat_expired,
            connection_errors = snapshot.connection_errors,
            loop_panics = snapshot.loop_panics,
            uptime_seconds = snapshot.uptime_seconds,
            "Server metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub packets_received: u64,
    pub packets_dispatched: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub heartbeat_expired: u64,
    pub connection_errors: u64,
    pub loop_panics: u64,
    pub uptime_seconds: u64,
}
