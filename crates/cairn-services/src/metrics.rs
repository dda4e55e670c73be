//! Hub metrics — counters for security drops and application outcomes.
//!
//! Security failures (decrypt, signature, unknown signer) are terminal and
//! silent on the wire, so these counters are the only place they surface
//! besides the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    decrypt_fail: AtomicU64,
    sig_invalid: AtomicU64,
    unknown_signer: AtomicU64,
    answer_fail: AtomicU64,
    capsules_stored: AtomicU64,
    retransmissions: AtomicU64,
    queries_served: AtomicU64,
}

/// Shared counter handle. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct HubMetrics {
    counters: Arc<Counters>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub decrypt_fail: u64,
    pub sig_invalid: u64,
    pub unknown_signer: u64,
    pub answer_fail: u64,
    pub capsules_stored: u64,
    pub retransmissions: u64,
    pub queries_served: u64,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decrypt_fail(&self) {
        self.counters.decrypt_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sig_invalid(&self) {
        self.counters.sig_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_signer(&self) {
        self.counters.unknown_signer.fetch_add(1, Ordering::Relaxed);
    }

    pub fn answer_fail(&self) {
        self.counters.answer_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capsule_stored(&self) {
        self.counters.capsules_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retransmission(&self) {
        self.counters.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query_served(&self) {
        self.counters.queries_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            decrypt_fail: self.counters.decrypt_fail.load(Ordering::Relaxed),
            sig_invalid: self.counters.sig_invalid.load(Ordering::Relaxed),
            unknown_signer: self.counters.unknown_signer.load(Ordering::Relaxed),
            answer_fail: self.counters.answer_fail.load(Ordering::Relaxed),
            capsules_stored: self.counters.capsules_stored.load(Ordering::Relaxed),
            retransmissions: self.counters.retransmissions.load(Ordering::Relaxed),
            queries_served: self.counters.queries_served.load(Ordering::Relaxed),
        }
    }

    /// Emit a one-line summary. Called periodically by the daemon.
    pub fn log_summary(&self, node: &str) {
        let s = self.snapshot();
        tracing::info!(
            node,
            queries = s.queries_served,
            stored = s.capsules_stored,
            retransmissions = s.retransmissions,
            decrypt_fail = s.decrypt_fail,
            sig_invalid = s.sig_invalid,
            unknown_signer = s.unknown_signer,
            answer_fail = s.answer_fail,
            "hub metrics"
        );
    }
}
