//! Observability and Metrics
//!
//! Per-connection counters for bus traffic and call correlation.
//!
//! Uses atomic counters for thread-safe metrics collection. Every
//! [`MessageBus`](crate::service::bus::MessageBus) owns one [`BusMetrics`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one bus connection
#[derive(Debug)]
pub struct BusMetrics {
    /// Messages written to the socket
    pub messages_sent: AtomicU64,
    /// Messages decoded from the socket
    pub messages_received: AtomicU64,
    /// Bytes written to the socket
    pub bytes_sent: AtomicU64,
    /// Bytes read from the socket
    pub bytes_received: AtomicU64,
    /// Calls registered in the pending table
    pub calls_started: AtomicU64,
    /// Replies matched to a pending call
    pub replies_matched: AtomicU64,
    /// Replies whose serial matched no pending call
    pub replies_discarded: AtomicU64,
    /// Error replies received
    pub errors_received: AtomicU64,
    /// Signals delivered to local subscribers
    pub signals_dispatched: AtomicU64,
    /// Method calls dispatched to exported objects
    pub calls_dispatched: AtomicU64,
    /// Calls currently awaiting a reply
    pub pending_calls: AtomicU64,
    /// Fatal connection errors
    pub connection_errors: AtomicU64,
    start_time: Instant,
}

impl BusMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            calls_started: AtomicU64::new(0),
            replies_matched: AtomicU64::new(0),
            replies_discarded: AtomicU64::new(0),
            errors_received: AtomicU64::new(0),
            signals_dispatched: AtomicU64::new(0),
            calls_dispatched: AtomicU64::new(0),
            pending_calls: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a message sent
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a message received
    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_matched(&self) {
        self.replies_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_discarded(&self) {
        self.replies_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_received(&self) {
        self.errors_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn signal_dispatched(&self) {
        self.signals_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_dispatched(&self) {
        self.calls_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Mirror the size of the pending table
    pub fn set_pending(&self, pending: usize) {
        self.pending_calls.store(pending as u64, Ordering::Relaxed);
    }

    /// Record a connection error
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            calls_started: self.calls_started.load(Ordering::Relaxed),
            replies_matched: self.replies_matched.load(Ordering::Relaxed),
            replies_discarded: self.replies_discarded.load(Ordering::Relaxed),
            errors_received: self.errors_received.load(Ordering::Relaxed),
            signals_dispatched: self.signals_dispatched.load(Ordering::Relaxed),
            calls_dispatched: self.calls_dispatched.load(Ordering::Relaxed),
            pending_calls: self.pending_calls.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            calls_started = snapshot.calls_started,
            replies_matched = snapshot.replies_matched,
            replies_discarded = snapshot.replies_discarded,
            errors_received = snapshot.errors_received,
            signals_dispatched = snapshot.signals_dispatched,
            calls_dispatched = snapshot.calls_dispatched,
            pending_calls = snapshot.pending_calls,
            connection_errors = snapshot.connection_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Bus metrics snapshot"
        );
    }
}

impl Default for BusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub calls_started: u64,
    pub replies_matched: u64,
    pub replies_discarded: u64,
    pub errors_received: u64,
    pub signals_dispatched: u64,
    pub calls_dispatched: u64,
    pub pending_calls: u64,
    pub connection_errors: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = BusMetrics::new();
        metrics.message_sent(16);
        metrics.message_sent(32);
        metrics.reply_discarded();
        metrics.set_pending(3);
        metrics.set_pending(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 48);
        assert_eq!(snapshot.replies_discarded, 1);
        assert_eq!(snapshot.pending_calls, 1);
    }
}
