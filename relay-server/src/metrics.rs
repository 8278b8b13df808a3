//! Operational metrics.
//!
//! All counters are monotonically increasing (reset only on restart) and
//! lock-free. Rendering to the Prometheus text format lives in
//! `http::metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds (ms) of the latency histogram buckets.
pub const LATENCY_BUCKETS_MS: [u64; 10] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000];

/// Protocol operations with their own counters and latency histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create_channel` / `join_channel`
    JoinChannel,
    /// `message`
    Message,
    /// `ack`
    Ack,
    /// `ping`
    Ping,
    /// `rejected`
    Rejected,
    /// `leave_channel`
    LeaveChannel,
    /// `check_room`
    CheckRoom,
}

impl Operation {
    /// Every operation, in rendering order.
    pub const ALL: [Operation; 7] = [
        Operation::JoinChannel,
        Operation::Message,
        Operation::Ack,
        Operation::Ping,
        Operation::Rejected,
        Operation::LeaveChannel,
        Operation::CheckRoom,
    ];

    /// Label value used in metric output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JoinChannel => "join_channel",
            Self::Message => "message",
            Self::Ack => "ack",
            Self::Ping => "ping",
            Self::Rejected => "rejected",
            Self::LeaveChannel => "leave_channel",
            Self::CheckRoom => "check_room",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Counters and latency histogram for one operation.
#[derive(Debug, Default)]
pub struct OperationStats {
    success: AtomicU64,
    errors: AtomicU64,
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len()],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl OperationStats {
    fn observe(&self, ok: bool, elapsed: Duration) {
        if ok {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let ms = elapsed.as_millis() as u64;
        if let Some(i) = LATENCY_BUCKETS_MS.iter().position(|&bound| ms <= bound) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful calls.
    pub fn successes(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    /// Failed calls.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Observations, success or not.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of observed durations in seconds.
    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Cumulative bucket counts, one per entry of [`LATENCY_BUCKETS_MS`].
    pub fn cumulative_buckets(&self) -> Vec<u64> {
        let mut total = 0;
        self.buckets
            .iter()
            .map(|b| {
                total += b.load(Ordering::Relaxed);
                total
            })
            .collect()
    }
}

/// Relay-wide metrics.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    operations: [OperationStats; Operation::ALL.len()],
    /// WebSocket connections accepted.
    pub connections_total: AtomicU64,
    /// Requests refused by the rate limiter.
    pub rate_limit_hits: AtomicU64,
    /// Records copied from legacy keys to hash-tagged keys.
    pub key_migrations: AtomicU64,
    /// Config reads that found a record.
    pub config_reads_hit: AtomicU64,
    /// Config reads that found nothing.
    pub config_reads_miss: AtomicU64,
    /// Messages appended to a queue.
    pub messages_queued: AtomicU64,
    /// Queue entries removed by ack.
    pub acks_removed: AtomicU64,
    /// Acks that matched no queued entry.
    pub acks_unmatched: AtomicU64,
    /// Broadcasts published for other instances.
    pub broadcasts_published: AtomicU64,
    /// Broadcasts received from other instances.
    pub broadcasts_received: AtomicU64,
    /// Store errors caught at a handler boundary.
    pub store_errors: AtomicU64,
}

impl RelayMetrics {
    /// Record one finished operation.
    pub fn observe(&self, op: Operation, ok: bool, elapsed: Duration) {
        self.operations[op.index()].observe(ok, elapsed);
    }

    /// Stats for one operation.
    pub fn operation(&self, op: Operation) -> &OperationStats {
        &self.operations[op.index()]
    }

    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
