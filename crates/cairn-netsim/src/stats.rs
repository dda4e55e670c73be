//! Link statistics — counters for every fate a frame can meet.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters for the simulator. Cheap to bump from any task.
#[derive(Debug, Default)]
pub struct SimStats {
    chunks_sent: AtomicU64,
    chunks_dropped: AtomicU64,
    naks_emitted: AtomicU64,
    acks_emitted: AtomicU64,
    packets_delivered: AtomicU64,
    reassembly_expired: AtomicU64,
    oversized_rejected: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub chunks_sent: u64,
    pub chunks_dropped: u64,
    pub naks_emitted: u64,
    pub acks_emitted: u64,
    pub packets_delivered: u64,
    pub reassembly_expired: u64,
    pub oversized_rejected: u64,
}

impl SimStats {
    pub fn chunk_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn nak_emitted(&self) {
        self.naks_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_emitted(&self) {
        self.acks_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_delivered(&self) {
        self.packets_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reassembly_expired(&self) {
        self.reassembly_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn oversized_rejected(&self) {
        self.oversized_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            naks_emitted: self.naks_emitted.load(Ordering::Relaxed),
            acks_emitted: self.acks_emitted.load(Ordering::Relaxed),
            packets_delivered: self.packets_delivered.load(Ordering::Relaxed),
            reassembly_expired: self.reassembly_expired.load(Ordering::Relaxed),
            oversized_rejected: self.oversized_rejected.load(Ordering::Relaxed),
        }
    }

    /// Emit a one-line summary. Called periodically by the daemon.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        tracing::info!(
            chunks_sent = s.chunks_sent,
            chunks_dropped = s.chunks_dropped,
            naks = s.naks_emitted,
            acks = s.acks_emitted,
            packets_delivered = s.packets_delivered,
            reassembly_expired = s.reassembly_expired,
            oversized_rejected = s.oversized_rejected,
            "netsim stats"
        );
    }
}
