//! Retransmit queue — backoff, offline buffering, and reconciliation.
//!
//! Each outbound packet that demands delivery gets a queue entry holding its
//! exact encoded bytes. The retransmit worker transmits entries as they come
//! due; a transmitted entry waits InFlight for its ACK window, and a NAK or
//! a missed window marks the attempt failed and schedules the next one after
//! an exponentially growing backoff. After `max_retries` transmissions the
//! entry fails terminally. Entries never touch the wire themselves — only
//! their encoded bytes do.
//!
//! A delivery that ends a failure streak triggers reconciliation: every
//! entry still Pending is made due immediately with its backoff reset, which
//! drains the queue promptly once a dead link comes back.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use cairn_core::capsule::now_millis;
use cairn_core::config::MiniSettings;
use cairn_core::wire::NodeId;

// ── Policy ────────────────────────────────────────────────────────────────────

/// Retransmission policy knobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    pub ack_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &MiniSettings) -> Self {
        Self {
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
            multiplier: settings.backoff_multiplier,
            max_retries: settings.max_retries,
            ack_timeout: Duration::from_millis(settings.ack_timeout_ms),
        }
    }

    /// Backoff before retransmission number `exponent`:
    /// `base × multiplier^(exponent−1)`.
    fn backoff(&self, exponent: u32) -> Duration {
        let factor = self.multiplier.powi(exponent.saturating_sub(1) as i32);
        self.base_backoff.mul_f64(factor)
    }
}

// ── Entries ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Waiting out its backoff until the next transmission.
    Pending,
    /// Transmitted; ACK window open.
    InFlight,
    /// Acknowledged or answered. Terminal.
    Delivered,
    /// Retry cap exceeded. Terminal.
    Failed,
}

struct QueueEntry {
    packet_id: Uuid,
    destination: NodeId,
    encoded: Bytes,
    attempts: u32,
    backoff_exponent: u32,
    next_attempt_at: Instant,
    first_enqueued_at: DateTime<Utc>,
    status: EntryStatus,
}

/// Read-only view of an entry for inspection and tests.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub packet_id: Uuid,
    pub destination: NodeId,
    pub attempts: u32,
    pub status: EntryStatus,
    pub first_enqueued_at: DateTime<Utc>,
}

/// One transmission the worker must perform.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub packet_id: Uuid,
    pub destination: NodeId,
    pub encoded: Bytes,
    pub attempt: u32,
}

/// Output of one due-entry pass.
#[derive(Debug, Default)]
pub struct DuePass {
    pub transmissions: Vec<Transmission>,
    pub failed: Vec<Uuid>,
}

/// Outcome of an ACK (or answered reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// The entry was live and is now Delivered.
    pub newly_delivered: bool,
    /// Pending entries made due immediately by reconciliation.
    pub reconciled: usize,
}

/// Queue snapshot persistence failure.
#[derive(Debug, thiserror::Error)]
#[error("queue persistence failure: {0}")]
pub struct PersistError(#[from] rusqlite::Error);

// ── Queue ─────────────────────────────────────────────────────────────────────

/// Shared retransmit queue. Cheap to clone; one worker drains it.
#[derive(Clone)]
pub struct RetransmitQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    policy: Arc<RetryPolicy>,
}

struct QueueState {
    entries: HashMap<Uuid, QueueEntry>,
    failure_streak: bool,
}

impl RetransmitQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                entries: HashMap::new(),
                failure_streak: false,
            })),
            notify: Arc::new(Notify::new()),
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Register a packet for reliable delivery. The worker transmits it on
    /// its next pass; until then it is Pending and due immediately.
    pub fn enqueue(&self, packet_id: Uuid, destination: NodeId, encoded: Bytes) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.entries.insert(
            packet_id,
            QueueEntry {
                packet_id,
                destination,
                encoded,
                attempts: 0,
                backoff_exponent: 0,
                next_attempt_at: Instant::now(),
                first_enqueued_at: now_millis(),
                status: EntryStatus::Pending,
            },
        );
        drop(state);
        self.notify.notify_one();
        tracing::debug!(packet_id = %packet_id, "queue entry created");
    }

    /// Advance every entry due at `now`.
    ///
    /// Due Pending entries either transmit (returned in the pass) or, at the
    /// retry cap, fail terminally. Due InFlight entries missed their ACK
    /// window: the attempt is recorded failed and the entry re-enters
    /// Pending after its backoff.
    pub fn take_due(&self, now: Instant) -> DuePass {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let mut pass = DuePass::default();
        let mut streak = false;

        for entry in state.entries.values_mut() {
            if entry.next_attempt_at > now {
                continue;
            }
            match entry.status {
                EntryStatus::Delivered | EntryStatus::Failed => {}

                EntryStatus::InFlight => {
                    // ACK window elapsed without acknowledgement.
                    streak = true;
                    entry.status = EntryStatus::Pending;
                    entry.backoff_exponent += 1;
                    entry.next_attempt_at = now + self.policy.backoff(entry.backoff_exponent);
                    tracing::debug!(
                        packet_id = %entry.packet_id,
                        attempt = entry.attempts,
                        "ack timeout, backing off"
                    );
                }

                EntryStatus::Pending => {
                    if entry.attempts >= self.policy.max_retries {
                        entry.status = EntryStatus::Failed;
                        pass.failed.push(entry.packet_id);
                        tracing::warn!(
                            packet_id = %entry.packet_id,
                            attempts = entry.attempts,
                            "retry cap exceeded, entry failed"
                        );
                        continue;
                    }
                    entry.attempts += 1;
                    entry.status = EntryStatus::InFlight;
                    entry.next_attempt_at = now + self.policy.ack_timeout;
                    pass.transmissions.push(Transmission {
                        packet_id: entry.packet_id,
                        destination: entry.destination,
                        encoded: entry.encoded.clone(),
                        attempt: entry.attempts,
                    });
                }
            }
        }

        if streak || !pass.failed.is_empty() {
            state.failure_streak = true;
        }
        pass
    }

    /// The earliest deadline among live entries, for the worker's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        let state = self.state.lock().expect("queue lock poisoned");
        state
            .entries
            .values()
            .filter(|e| matches!(e.status, EntryStatus::Pending | EntryStatus::InFlight))
            .map(|e| e.next_attempt_at)
            .min()
    }

    /// Record a successful delivery for `packet_id` — a transport ACK or an
    /// answered reply, whichever arrives first. Duplicates are idempotent.
    ///
    /// When the delivery ends a failure streak, every Pending entry is made
    /// due immediately with its backoff reset (link-up drain).
    pub fn on_ack(&self, packet_id: Uuid) -> AckOutcome {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let now = Instant::now();

        let newly_delivered = match state.entries.get_mut(&packet_id) {
            Some(entry) if matches!(entry.status, EntryStatus::Pending | EntryStatus::InFlight) => {
                entry.status = EntryStatus::Delivered;
                true
            }
            _ => false,
        };

        let mut reconciled = 0;
        if newly_delivered && state.failure_streak {
            for entry in state.entries.values_mut() {
                if entry.status == EntryStatus::Pending {
                    entry.next_attempt_at = now;
                    entry.backoff_exponent = 0;
                    reconciled += 1;
                }
            }
            state.failure_streak = false;
        }
        drop(state);

        if newly_delivered {
            tracing::debug!(packet_id = %packet_id, reconciled, "queue entry delivered");
        }
        if reconciled > 0 {
            self.notify.notify_one();
        }

        AckOutcome {
            newly_delivered,
            reconciled,
        }
    }

    /// A chunk of `packet_id` was lost. The open attempt is recorded failed
    /// and the entry re-enters Pending after its backoff. A NAK and the same
    /// window's ACK timeout collapse into one retransmission — whichever the
    /// worker sees first wins, the other finds the entry already Pending.
    pub fn on_nak(&self, packet_id: Uuid, chunk_index: u16) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let Some(entry) = state.entries.get_mut(&packet_id) else {
            return;
        };
        if entry.status != EntryStatus::InFlight {
            return;
        }
        entry.status = EntryStatus::Pending;
        entry.backoff_exponent += 1;
        entry.next_attempt_at = Instant::now() + self.policy.backoff(entry.backoff_exponent);
        state.failure_streak = true;
        drop(state);

        tracing::debug!(packet_id = %packet_id, chunk_index, "nak received, retransmit scheduled");
        self.notify.notify_one();
    }

    pub fn status(&self, packet_id: &Uuid) -> Option<EntryStatus> {
        let state = self.state.lock().expect("queue lock poisoned");
        state.entries.get(packet_id).map(|e| e.status)
    }

    pub fn snapshot(&self, packet_id: &Uuid) -> Option<EntrySnapshot> {
        let state = self.state.lock().expect("queue lock poisoned");
        state.entries.get(packet_id).map(snapshot_of)
    }

    pub fn snapshots(&self) -> Vec<EntrySnapshot> {
        let state = self.state.lock().expect("queue lock poisoned");
        state.entries.values().map(snapshot_of).collect()
    }

    /// Live (Pending or InFlight) entry count.
    pub fn live_count(&self) -> usize {
        let state = self.state.lock().expect("queue lock poisoned");
        state
            .entries
            .values()
            .filter(|e| matches!(e.status, EntryStatus::Pending | EntryStatus::InFlight))
            .count()
    }

    /// Drop terminal entries to bound memory.
    pub fn purge_completed(&self) -> usize {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| matches!(e.status, EntryStatus::Pending | EntryStatus::InFlight));
        before - state.entries.len()
    }

    /// Wait for new work: an enqueue, a NAK, or a reconciliation.
    pub async fn work_available(&self) {
        self.notify.notified().await;
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Snapshot live entries to SQLite so they resume after a restart.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<usize, PersistError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue_entries (
                packet_id       TEXT PRIMARY KEY,
                destination     BLOB NOT NULL,
                encoded         BLOB NOT NULL,
                attempts        INTEGER NOT NULL,
                next_attempt_at INTEGER NOT NULL,
                status          TEXT NOT NULL,
                first_enqueued  INTEGER NOT NULL
            );
            DELETE FROM queue_entries;",
        )?;

        let state = self.state.lock().expect("queue lock poisoned");
        let now_instant = Instant::now();
        let now_wall = now_millis().timestamp_millis();
        let mut saved = 0usize;
        for entry in state.entries.values() {
            if !matches!(entry.status, EntryStatus::Pending | EntryStatus::InFlight) {
                continue;
            }
            // Monotonic deadlines do not survive the process; record the
            // wall-clock equivalent for inspection.
            let remaining = entry
                .next_attempt_at
                .saturating_duration_since(now_instant)
                .as_millis() as i64;
            let status = match entry.status {
                EntryStatus::Pending => "pending",
                EntryStatus::InFlight => "in_flight",
                EntryStatus::Delivered => "delivered",
                EntryStatus::Failed => "failed",
            };
            conn.execute(
                "INSERT INTO queue_entries
                 (packet_id, destination, encoded, attempts, next_attempt_at, status,
                  first_enqueued)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.packet_id.to_string(),
                    entry.destination.as_slice(),
                    entry.encoded.as_ref(),
                    entry.attempts,
                    now_wall + remaining,
                    status,
                    entry.first_enqueued_at.timestamp_millis(),
                ],
            )?;
            saved += 1;
        }
        tracing::info!(count = saved, "queue entries persisted");
        Ok(saved)
    }

    /// Reload persisted entries. Restored entries are Pending and due
    /// immediately; their attempt counts carry over so the retry cap still
    /// binds across restarts.
    pub fn restore(&self, path: impl AsRef<Path>) -> Result<usize, PersistError> {
        if !path.as_ref().exists() {
            return Ok(0);
        }
        let conn = Connection::open(path)?;
        let table_exists: bool = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='queue_entries'")?
            .exists([])?;
        if !table_exists {
            return Ok(0);
        }

        let mut stmt = conn.prepare(
            "SELECT packet_id, destination, encoded, attempts, first_enqueued FROM queue_entries",
        )?;
        // status and next_attempt_at are recorded for inspection but not
        // honored here: an in-flight transmission cannot survive a restart,
        // and monotonic deadlines from a previous boot are meaningless. Every
        // restored entry resumes Pending and due immediately.
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut state = self.state.lock().expect("queue lock poisoned");
        let mut restored = 0usize;
        for row in rows {
            let (id, dst, encoded, attempts, first_ms) = row?;
            let Ok(packet_id) = Uuid::parse_str(&id) else {
                continue;
            };
            let Ok(destination) = <NodeId>::try_from(dst.as_slice()) else {
                continue;
            };
            let first_enqueued_at = chrono::TimeZone::timestamp_millis_opt(&Utc, first_ms)
                .single()
                .unwrap_or_else(now_millis);
            state.entries.insert(
                packet_id,
                QueueEntry {
                    packet_id,
                    destination,
                    encoded: Bytes::from(encoded),
                    attempts,
                    backoff_exponent: 0,
                    next_attempt_at: Instant::now(),
                    first_enqueued_at,
                    status: EntryStatus::Pending,
                },
            );
            restored += 1;
        }
        drop(state);

        if restored > 0 {
            tracing::info!(count = restored, "queue entries restored");
            self.notify.notify_one();
        }
        Ok(restored)
    }
}

fn snapshot_of(entry: &QueueEntry) -> EntrySnapshot {
    EntrySnapshot {
        packet_id: entry.packet_id,
        destination: entry.destination,
        attempts: entry.attempts,
        status: entry.status,
        first_enqueued_at: entry.first_enqueued_at,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::wire::node_id;

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_retries: 6,
            ack_timeout: Duration::from_millis(50),
        }
    }

    fn queue_with_entry() -> (RetransmitQueue, Uuid) {
        let queue = RetransmitQueue::new(test_policy());
        let packet_id = Uuid::new_v4();
        queue.enqueue(packet_id, node_id("main"), Bytes::from_static(b"encoded"));
        (queue, packet_id)
    }

    #[tokio::test]
    async fn enqueue_is_due_immediately() {
        let (queue, packet_id) = queue_with_entry();
        let pass = queue.take_due(Instant::now());
        assert_eq!(pass.transmissions.len(), 1);
        assert_eq!(pass.transmissions[0].packet_id, packet_id);
        assert_eq!(pass.transmissions[0].attempt, 1);
        assert_eq!(queue.status(&packet_id), Some(EntryStatus::InFlight));
    }

    #[tokio::test]
    async fn ack_timeout_backs_off_then_retransmits() {
        let (queue, packet_id) = queue_with_entry();
        let t0 = Instant::now();
        queue.take_due(t0);

        // ACK window (50ms) expires: entry backs off, no transmission yet.
        let t1 = t0 + Duration::from_millis(50);
        let pass = queue.take_due(t1);
        assert!(pass.transmissions.is_empty());
        assert_eq!(queue.status(&packet_id), Some(EntryStatus::Pending));

        // Backoff (100ms) elapses: second transmission.
        let t2 = t1 + Duration::from_millis(100);
        let pass = queue.take_due(t2);
        assert_eq!(pass.transmissions.len(), 1);
        assert_eq!(pass.transmissions[0].attempt, 2);
    }

    #[tokio::test]
    async fn backoff_windows_grow_by_multiplier() {
        let (queue, _) = queue_with_entry();
        let mut now = Instant::now();
        let mut backoffs = Vec::new();

        for _ in 0..5 {
            // Transmit, then expire the ACK window.
            queue.take_due(now);
            now = queue.next_deadline().unwrap();
            queue.take_due(now);
            // Entry is Pending; its deadline is the backoff window.
            let deadline = queue.next_deadline().unwrap();
            backoffs.push(deadline - now);
            now = deadline;
        }

        // 100, 200, 400, 800, 1600 ms — each window doubles.
        for pair in backoffs.windows(2) {
            let ratio = pair[1].as_secs_f64() / pair[0].as_secs_f64();
            assert!(ratio >= 1.99, "ratio {ratio} below multiplier");
        }
    }

    #[tokio::test]
    async fn retry_cap_fails_entry_terminally() {
        let (queue, packet_id) = queue_with_entry();
        let mut now = Instant::now();

        let mut total_transmissions = 0;
        loop {
            let pass = queue.take_due(now);
            total_transmissions += pass.transmissions.len();
            if !pass.failed.is_empty() {
                assert_eq!(pass.failed, vec![packet_id]);
                break;
            }
            now = queue.next_deadline().unwrap();
        }

        assert_eq!(total_transmissions, 6);
        assert_eq!(queue.status(&packet_id), Some(EntryStatus::Failed));
        assert_eq!(queue.snapshot(&packet_id).unwrap().attempts, 6);

        // No further transmissions, ever.
        let pass = queue.take_due(now + Duration::from_secs(3600));
        assert!(pass.transmissions.is_empty());
        assert!(pass.failed.is_empty());
    }

    #[tokio::test]
    async fn ack_delivers_and_is_idempotent() {
        let (queue, packet_id) = queue_with_entry();
        queue.take_due(Instant::now());

        let first = queue.on_ack(packet_id);
        assert!(first.newly_delivered);
        assert_eq!(queue.status(&packet_id), Some(EntryStatus::Delivered));

        let second = queue.on_ack(packet_id);
        assert!(!second.newly_delivered, "duplicate ACKs are idempotent");
    }

    #[tokio::test]
    async fn ack_for_unknown_packet_is_ignored() {
        let (queue, _) = queue_with_entry();
        let outcome = queue.on_ack(Uuid::new_v4());
        assert!(!outcome.newly_delivered);
        assert_eq!(outcome.reconciled, 0);
    }

    #[tokio::test]
    async fn nak_schedules_backoff_retransmit() {
        let (queue, packet_id) = queue_with_entry();
        let t0 = Instant::now();
        queue.take_due(t0);
        assert_eq!(queue.status(&packet_id), Some(EntryStatus::InFlight));

        queue.on_nak(packet_id, 0);
        assert_eq!(queue.status(&packet_id), Some(EntryStatus::Pending));

        // Not due before the backoff elapses.
        let pass = queue.take_due(Instant::now());
        assert!(pass.transmissions.is_empty());

        let pass = queue.take_due(Instant::now() + Duration::from_millis(150));
        assert_eq!(pass.transmissions.len(), 1);
        assert_eq!(pass.transmissions[0].attempt, 2);
    }

    #[tokio::test]
    async fn nak_and_ack_timeout_yield_one_retransmission() {
        let (queue, packet_id) = queue_with_entry();
        let t0 = Instant::now();
        queue.take_due(t0);

        // NAK lands first; the later ACK-timeout pass finds the entry
        // already Pending and leaves it alone.
        queue.on_nak(packet_id, 1);
        let at_old_ack_deadline = queue.take_due(t0 + Duration::from_millis(50));
        assert!(at_old_ack_deadline.transmissions.is_empty());

        let after_backoff = queue.take_due(Instant::now() + Duration::from_millis(150));
        assert_eq!(after_backoff.transmissions.len(), 1);
    }

    #[tokio::test]
    async fn nak_on_pending_entry_is_ignored() {
        let (queue, packet_id) = queue_with_entry();
        queue.take_due(Instant::now());
        queue.on_nak(packet_id, 0);
        let deadline = queue.next_deadline().unwrap();

        queue.on_nak(packet_id, 1);
        assert_eq!(queue.next_deadline().unwrap(), deadline);
    }

    #[tokio::test]
    async fn reconciliation_drains_pending_after_recovery() {
        let queue = RetransmitQueue::new(test_policy());
        let recovered = Uuid::new_v4();
        let stuck_a = Uuid::new_v4();
        let stuck_b = Uuid::new_v4();
        let dst = node_id("main");
        queue.enqueue(recovered, dst, Bytes::from_static(b"r"));
        queue.enqueue(stuck_a, dst, Bytes::from_static(b"a"));
        queue.enqueue(stuck_b, dst, Bytes::from_static(b"b"));

        // All transmitted; the dead link NAKs everything, so all three sit
        // Pending with backoff deadlines in the future.
        queue.take_due(Instant::now());
        queue.on_nak(recovered, 0);
        queue.on_nak(stuck_a, 0);
        queue.on_nak(stuck_b, 0);

        // The link comes back and the recovered entry's late ACK arrives.
        let outcome = queue.on_ack(recovered);
        assert!(outcome.newly_delivered);
        assert_eq!(outcome.reconciled, 2, "stuck entries reset to due-now");

        let pass = queue.take_due(Instant::now());
        assert_eq!(pass.transmissions.len(), 2);
    }

    #[tokio::test]
    async fn attempts_never_exceed_cap() {
        let (queue, packet_id) = queue_with_entry();
        let mut now = Instant::now();
        for _ in 0..20 {
            queue.take_due(now);
            queue.on_nak(packet_id, 0);
            now += Duration::from_secs(60);
        }
        let snapshot = queue.snapshot(&packet_id).unwrap();
        assert!(snapshot.attempts <= 6);
        assert_eq!(snapshot.status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn purge_drops_terminal_entries_only() {
        let queue = RetransmitQueue::new(test_policy());
        let done = Uuid::new_v4();
        let live = Uuid::new_v4();
        let dst = node_id("main");
        queue.enqueue(done, dst, Bytes::from_static(b"d"));
        queue.enqueue(live, dst, Bytes::from_static(b"l"));
        queue.take_due(Instant::now());
        queue.on_ack(done);

        assert_eq!(queue.purge_completed(), 1);
        assert!(queue.status(&done).is_none());
        assert_eq!(queue.status(&live), Some(EntryStatus::InFlight));
    }

    #[tokio::test]
    async fn persist_and_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let dst = node_id("main");

        let (queue, live_id) = queue_with_entry();
        let delivered_id = Uuid::new_v4();
        queue.enqueue(delivered_id, dst, Bytes::from_static(b"done"));
        queue.take_due(Instant::now());
        queue.on_ack(delivered_id);

        assert_eq!(queue.persist(&path).unwrap(), 1);

        let restored = RetransmitQueue::new(test_policy());
        assert_eq!(restored.restore(&path).unwrap(), 1);
        let snapshot = restored.snapshot(&live_id).unwrap();
        assert_eq!(snapshot.status, EntryStatus::Pending);
        assert_eq!(snapshot.attempts, 1, "attempt count survives restart");

        let pass = restored.take_due(Instant::now());
        assert_eq!(pass.transmissions.len(), 1);
        assert_eq!(pass.transmissions[0].encoded, Bytes::from_static(b"encoded"));
    }

    #[tokio::test]
    async fn restore_missing_file_is_empty() {
        let queue = RetransmitQueue::new(test_policy());
        assert_eq!(queue.restore("/nonexistent/queue.db").unwrap(), 0);
    }
}
