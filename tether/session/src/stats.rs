//! Cumulative traffic counters for the server.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Monotonic counters, shared across sessions and reset on demand.
///
/// `reset` zeroes the counters only; the start time and uptime clock are
/// fixed at construction and never restart.
pub struct ServerStats {
    started_at: SystemTime,
    started: Instant,
    connections: AtomicU64,
    received_messages: AtomicU64,
    received_bytes: AtomicU64,
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub received_messages: u64,
    pub received_bytes: u64,
    pub sent_messages: u64,
    pub sent_bytes: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: SystemTime::now(),
            started: Instant::now(),
            connections: AtomicU64::new(0),
            received_messages: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            sent_messages: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
        }
    }

    /// Account one accepted connection.
    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one inbound message of `bytes` wire bytes.
    pub fn record_received(&self, bytes: u64) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account one outbound message of `bytes` wire bytes.
    pub fn record_sent(&self, bytes: u64) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Wall-clock time the server started.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Time since the server started. Unaffected by `reset`.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Zero all counters. Start time and uptime keep running.
    pub fn reset(&self) {
        self.connections.store(0, Ordering::Relaxed);
        self.received_messages.store(0, Ordering::Relaxed);
        self.received_bytes.store(0, Ordering::Relaxed);
        self.sent_messages.store(0, Ordering::Relaxed);
        self.sent_bytes.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            received_messages: self.received_messages.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snap = self.snapshot();
        write!(
            f,
            "up {:?}: {} connections, rx {} msgs / {} bytes, tx {} msgs / {} bytes",
            self.uptime(),
            snap.connections,
            snap.received_messages,
            snap.received_bytes,
            snap.sent_messages,
            snap.sent_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = ServerStats::new();
        stats.record_connection();
        stats.record_received(100);
        stats.record_received(50);
        stats.record_sent(7);

        let snap = stats.snapshot();
        assert_eq!(snap.connections, 1);
        assert_eq!(snap.received_messages, 2);
        assert_eq!(snap.received_bytes, 150);
        assert_eq!(snap.sent_messages, 1);
        assert_eq!(snap.sent_bytes, 7);
    }

    #[test]
    fn test_reset_zeroes_counters_only() {
        let stats = ServerStats::new();
        stats.record_connection();
        stats.record_received(1024);
        stats.record_sent(2048);

        std::thread::sleep(Duration::from_millis(50));
        let before = stats.uptime();
        let started = stats.started_at();
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.connections, 0);
        assert_eq!(snap.received_messages, 0);
        assert_eq!(snap.received_bytes, 0);
        assert_eq!(snap.sent_messages, 0);
        assert_eq!(snap.sent_bytes, 0);

        // Start time and the uptime clock survive a reset.
        assert_eq!(stats.started_at(), started);
        assert!(stats.uptime() >= before);
    }
}
