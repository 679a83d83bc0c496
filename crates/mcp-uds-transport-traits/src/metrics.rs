//! Transport metrics types.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A serializable snapshot of a transport's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportMetrics {
    /// Total number of bytes written to peers.
    pub bytes_sent: u64,

    /// Total number of bytes read from peers.
    pub bytes_received: u64,

    /// Total number of messages written.
    pub messages_sent: u64,

    /// Total number of messages received and queued for dispatch.
    pub messages_received: u64,

    /// Total number of peers accepted or connected.
    pub connections: u64,

    /// Total number of failed bind, accept or connect attempts.
    pub failed_connections: u64,

    /// Number of peers currently attached (0 or 1).
    pub active_connections: u64,

    /// Number of connection generations created.
    pub generations: u64,

    /// Number of automatic restarts performed.
    pub restarts: u64,

    /// Number of times a generation's writer was released.
    pub writer_releases: u64,

    /// Number of outbound messages that were queued but never written.
    pub failed_deliveries: u64,

    /// The average write latency, in milliseconds.
    pub average_latency_ms: f64,
}

/// Lock-free counters shared between the pipes of every generation.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    /// Total bytes sent (atomic counter).
    pub bytes_sent: AtomicU64,

    /// Total bytes received (atomic counter).
    pub bytes_received: AtomicU64,

    /// Total messages sent (atomic counter).
    pub messages_sent: AtomicU64,

    /// Total messages received (atomic counter).
    pub messages_received: AtomicU64,

    /// Total peers attached (atomic counter).
    pub connections: AtomicU64,

    /// Failed bind/accept/connect attempts (atomic counter).
    pub failed_connections: AtomicU64,

    /// Current active connections (atomic counter).
    pub active_connections: AtomicU64,

    /// Generations created (atomic counter).
    pub generations: AtomicU64,

    /// Automatic restarts (atomic counter).
    pub restarts: AtomicU64,

    /// Writer releases (atomic counter).
    pub writer_releases: AtomicU64,

    /// Queued messages failed without being written (atomic counter).
    pub failed_deliveries: AtomicU64,

    /// Exponential moving average of write latency in microseconds.
    avg_latency_us: AtomicU64,
}

impl AtomicMetrics {
    /// Creates a new `AtomicMetrics` instance with all counters initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one written message of `bytes` bytes.
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one received message of `bytes` bytes.
    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A peer was attached.
    pub fn record_connected(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A previously attached peer went away.
    pub fn record_disconnected(&self) {
        // Never wrap below zero if a disconnect is reported twice.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Updates the average latency using an exponential moving average (EMA).
    pub fn update_latency_us(&self, latency_us: u64) {
        let current = self.avg_latency_us.load(Ordering::Relaxed);
        let new_avg = if current == 0 {
            latency_us
        } else {
            // alpha = 0.1
            current.saturating_mul(9).saturating_add(latency_us) / 10
        };
        self.avg_latency_us.store(new_avg, Ordering::Relaxed);
    }

    /// Creates a serializable `TransportMetrics` snapshot from the current atomic values.
    pub fn snapshot(&self) -> TransportMetrics {
        TransportMetrics {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            generations: self.generations.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            writer_releases: self.writer_releases.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
            average_latency_ms: (self.avg_latency_us.load(Ordering::Relaxed) as f64) / 1000.0,
        }
    }
}
