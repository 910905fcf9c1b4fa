//! Connection Statistics
//!
//! Each reactor owns one `ConnectionStats` and is its only writer, so the
//! counters never bounce between cores. Readers on other threads take a
//! relaxed snapshot and sum the per-reactor snapshots.

use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the connections driven by one reactor.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections started
    pub connections_accepted: AtomicU64,
    /// Currently open connections
    pub active_connections: AtomicU64,
    /// Requests framed and handed to the request handler
    pub requests_dispatched: AtomicU64,
    /// Responses written to the wire
    pub responses_written: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_dispatched(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_written(&self, bytes: usize) {
        self.responses_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            responses_written: self.responses_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`ConnectionStats`], summable across reactors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub requests_dispatched: u64,
    pub responses_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl Add for StatsSnapshot {
    type Output = StatsSnapshot;

    fn add(self, other: StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted + other.connections_accepted,
            active_connections: self.active_connections + other.active_connections,
            requests_dispatched: self.requests_dispatched + other.requests_dispatched,
            responses_written: self.responses_written + other.responses_written,
            bytes_read: self.bytes_read + other.bytes_read,
            bytes_written: self.bytes_written + other.bytes_written,
        }
    }
}

impl std::iter::Sum for StatsSnapshot {
    fn sum<I: Iterator<Item = StatsSnapshot>>(iter: I) -> Self {
        iter.fold(StatsSnapshot::default(), Add::add)
    }
}
