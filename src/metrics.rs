//! Counters for network traffic and per-stream read behaviour.
//!
//! The executor reports into a [`MetricsSink`]; implementations must be
//! fire-and-forget. Nothing in the read or retry path branches on a counter
//! value.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::rest::OperationType;

const STATISTIC_COUNT: usize = 8;

/// Network-level statistics reported per physical attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    ConnectionsMade,
    SendRequests,
    BytesSent,
    GetResponses,
    BytesReceived,
    ServerUnavailable,
    Throttled,
    RetriedRequests,
}

impl Statistic {
    pub const ALL: [Statistic; STATISTIC_COUNT] = [
        Statistic::ConnectionsMade,
        Statistic::SendRequests,
        Statistic::BytesSent,
        Statistic::GetResponses,
        Statistic::BytesReceived,
        Statistic::ServerUnavailable,
        Statistic::Throttled,
        Statistic::RetriedRequests,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Statistic::ConnectionsMade => "connections_made",
            Statistic::SendRequests => "send_requests",
            Statistic::BytesSent => "bytes_sent",
            Statistic::GetResponses => "get_responses",
            Statistic::BytesReceived => "bytes_received",
            Statistic::ServerUnavailable => "server_unavailable",
            Statistic::Throttled => "throttled",
            Statistic::RetriedRequests => "retried_requests",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Sink for executor statistics.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, statistic: Statistic, amount: u64);

    /// Latency of one physical attempt.
    fn record_latency(&self, _operation: OperationType, _elapsed: Duration) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _statistic: Statistic, _amount: u64) {}
}

/// In-memory atomic counters.
#[derive(Debug, Default)]
pub struct Counters {
    values: [AtomicU64; STATISTIC_COUNT],
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, statistic: Statistic) -> u64 {
        self.values[statistic.index()].load(Ordering::Relaxed)
    }

    /// Snapshot of every counter in declaration order.
    pub fn snapshot(&self) -> Vec<(Statistic, u64)> {
        Statistic::ALL.iter().map(|s| (*s, self.get(*s))).collect()
    }
}

impl MetricsSink for Counters {
    fn increment_counter(&self, statistic: Statistic, amount: u64) {
        self.values[statistic.index()].fetch_add(amount, Ordering::Relaxed);
    }
}

/// Per-stream read statistics.
#[derive(Debug, Default)]
pub struct StreamStatistics {
    seek_operations: AtomicU64,
    forward_seek_operations: AtomicU64,
    backward_seek_operations: AtomicU64,
    bytes_skipped_on_seek: AtomicU64,
    bytes_backwards_on_seek: AtomicU64,
    bytes_read: AtomicU64,
    bytes_read_from_buffer: AtomicU64,
    read_operations: AtomicU64,
    remote_read_operations: AtomicU64,
    read_ahead_queued: AtomicU64,
}

impl StreamStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seek(&self, seek_to: u64, current: u64) {
        self.seek_operations.fetch_add(1, Ordering::Relaxed);
        if seek_to >= current {
            self.forward_seek_operations.fetch_add(1, Ordering::Relaxed);
            self.bytes_skipped_on_seek
                .fetch_add(seek_to - current, Ordering::Relaxed);
        } else {
            self.backward_seek_operations.fetch_add(1, Ordering::Relaxed);
            self.bytes_backwards_on_seek
                .fetch_add(current - seek_to, Ordering::Relaxed);
        }
    }

    pub(crate) fn read_operation_started(&self) {
        self.read_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn bytes_read_from_buffer(&self, n: u64) {
        self.bytes_read_from_buffer.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn remote_read_operation(&self) {
        self.remote_read_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn read_ahead_queued(&self) {
        self.read_ahead_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn seek_operations(&self) -> u64 {
        self.seek_operations.load(Ordering::Relaxed)
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn total_bytes_read_from_buffer(&self) -> u64 {
        self.bytes_read_from_buffer.load(Ordering::Relaxed)
    }

    pub fn read_operations(&self) -> u64 {
        self.read_operations.load(Ordering::Relaxed)
    }

    pub fn remote_read_operations(&self) -> u64 {
        self.remote_read_operations.load(Ordering::Relaxed)
    }

    pub fn read_ahead_requests(&self) -> u64 {
        self.read_ahead_queued.load(Ordering::Relaxed)
    }
}

impl fmt::Display for StreamStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        write!(
            f,
            "StreamStatistics{{seek_ops={}, forward_seeks={}, backward_seeks={}, \
             bytes_skipped={}, bytes_backwards={}, bytes_read={}, \
             bytes_read_from_buffer={}, read_ops={}, remote_reads={}, read_ahead_queued={}}}",
            load(&self.seek_operations),
            load(&self.forward_seek_operations),
            load(&self.backward_seek_operations),
            load(&self.bytes_skipped_on_seek),
            load(&self.bytes_backwards_on_seek),
            load(&self.bytes_read),
            load(&self.bytes_read_from_buffer),
            load(&self.read_operations),
            load(&self.remote_read_operations),
            load(&self.read_ahead_queued),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_per_statistic() {
        let counters = Counters::new();
        counters.increment_counter(Statistic::BytesReceived, 1024);
        counters.increment_counter(Statistic::BytesReceived, 512);
        counters.increment_counter(Statistic::GetResponses, 1);

        assert_eq!(counters.get(Statistic::BytesReceived), 1536);
        assert_eq!(counters.get(Statistic::GetResponses), 1);
        assert_eq!(counters.get(Statistic::BytesSent), 0);
        assert_eq!(counters.snapshot().len(), Statistic::ALL.len());
    }

    #[test]
    fn test_stream_statistics_seek_direction() {
        let stats = StreamStatistics::new();
        stats.seek(100, 10);
        stats.seek(5, 100);

        assert_eq!(stats.seek_operations(), 2);
        let text = stats.to_string();
        assert!(text.contains("forward_seeks=1"));
        assert!(text.contains("backward_seeks=1"));
        assert!(text.contains("bytes_skipped=90"));
        assert!(text.contains("bytes_backwards=95"));
    }
}
