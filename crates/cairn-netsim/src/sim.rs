//! The simulated link — sole transport between hubs.
//!
//! Every encoded packet submitted here is fragmented into chunks, and each
//! chunk independently suffers the configured loss, latency, jitter,
//! bandwidth pacing, and reordering before arriving at the destination's
//! reassembly buffer. Lost chunks produce a NAK back to the sender; a fully
//! reassembled packet produces exactly one ACK.
//!
//! Configuration is runtime-mutable; each submitted frame captures a
//! point-in-time snapshot at admission, so a knob change mid-flight never
//! tears a frame's parameters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use cairn_core::codec;
use cairn_core::config::SimSettings;
use cairn_core::wire::{NodeId, WireError};

use crate::pacing::ByteBucket;
use crate::stats::{SimStats, StatsSnapshot};

/// Capacity of each endpoint's event channel.
const ENDPOINT_CHANNEL_CAPACITY: usize = 1024;

/// How often the reassembly sweeper checks for expired buffers.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

// ── Events & errors ───────────────────────────────────────────────────────────

/// Transport callbacks pushed to an attached endpoint.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A fully reassembled encoded packet addressed to this endpoint.
    Packet(Bytes),

    /// The packet this endpoint sent was fully reassembled at its
    /// destination. Duplicates are possible and idempotent.
    Ack { packet_id: Uuid },

    /// One chunk of the packet this endpoint sent was lost.
    Nak { packet_id: Uuid, chunk_index: u16 },
}

/// Synchronous admission failures, reported to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("encoded packet of {len} bytes exceeds max chunk size {max} and auto-chunk is off")]
    Oversized { len: usize, max: usize },

    #[error("no endpoint attached for destination {0}")]
    UnknownDestination(String),

    #[error("simulator is down")]
    SimulatorDown,

    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),
}

// ── Simulator ─────────────────────────────────────────────────────────────────

/// Handle to the shared link simulator. Cheap to clone.
#[derive(Clone)]
pub struct NetSim {
    inner: Arc<SimInner>,
}

struct SimInner {
    config: RwLock<Arc<SimSettings>>,
    endpoints: DashMap<NodeId, mpsc::Sender<LinkEvent>>,
    bucket: Mutex<ByteBucket>,
    assemblies: DashMap<(NodeId, Uuid), Assembly>,
    rng: Mutex<StdRng>,
    stats: SimStats,
    down: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

/// Reassembly buffer for one (destination, packet) pair.
struct Assembly {
    chunks: HashMap<u16, Bytes>,
    chunk_count: u16,
    src: NodeId,
    started_at: Instant,
}

impl NetSim {
    /// A simulator seeded from entropy.
    pub fn new(settings: SimSettings) -> Self {
        Self::build(settings, StdRng::from_entropy())
    }

    /// A deterministic simulator: the same seed and submission order
    /// reproduce the same loss and delay draws.
    pub fn with_seed(settings: SimSettings, seed: u64) -> Self {
        Self::build(settings, StdRng::seed_from_u64(seed))
    }

    fn build(settings: SimSettings, rng: StdRng) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let inner = Arc::new(SimInner {
            bucket: Mutex::new(ByteBucket::new(settings.bandwidth_bytes_per_sec)),
            config: RwLock::new(Arc::new(settings)),
            endpoints: DashMap::new(),
            assemblies: DashMap::new(),
            rng: Mutex::new(rng),
            stats: SimStats::default(),
            down: AtomicBool::new(false),
            shutdown,
        });

        let sim = Self { inner };
        sim.spawn_reassembly_sweeper();
        sim
    }

    /// Attach an endpoint; transport callbacks for `node` arrive on the
    /// returned receiver. Re-attaching replaces the previous endpoint.
    pub fn attach(&self, node: NodeId) -> mpsc::Receiver<LinkEvent> {
        let (tx, rx) = mpsc::channel(ENDPOINT_CHANNEL_CAPACITY);
        self.inner.endpoints.insert(node, tx);
        rx
    }

    /// Current config snapshot.
    pub fn config(&self) -> Arc<SimSettings> {
        self.inner.config.read().expect("config lock poisoned").clone()
    }

    /// Replace the configuration atomically. Frames already admitted keep
    /// the snapshot they captured; the pacing bucket retargets immediately.
    pub fn update_config(&self, settings: SimSettings) {
        let mut bucket = self.inner.bucket.lock().expect("bucket lock poisoned");
        bucket.set_rate(settings.bandwidth_bytes_per_sec);
        drop(bucket);
        *self.inner.config.write().expect("config lock poisoned") = Arc::new(settings);
        tracing::info!("netsim config updated");
    }

    /// Convenience for tests and the admin surface: mutate a copy of the
    /// current snapshot and install it.
    pub fn mutate_config(&self, f: impl FnOnce(&mut SimSettings)) {
        let mut settings = (*self.config()).clone();
        f(&mut settings);
        self.update_config(settings);
    }

    /// Take the whole simulator down (or back up). While down, submissions
    /// fail synchronously.
    pub fn set_down(&self, down: bool) {
        self.inner.down.store(down, Ordering::SeqCst);
        tracing::info!(down, "netsim availability changed");
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn log_stats(&self) {
        self.inner.stats.log_summary();
    }

    /// Stop background tasks. In-flight chunk deliveries finish naturally.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
    }

    /// Submit an encoded packet for delivery.
    ///
    /// Admission is synchronous: oversized frames (with auto-chunk off),
    /// unknown destinations, and a downed simulator are reported here.
    /// Everything after admission — loss, delay, NAKs, reassembly — happens
    /// asynchronously against the config snapshot captured now.
    ///
    /// Each call is an independent fragmentation event; retransmissions of
    /// the same packet id are never coalesced.
    pub fn submit(&self, src: NodeId, dst: NodeId, encoded: Bytes) -> Result<(), SubmitError> {
        if self.inner.down.load(Ordering::SeqCst) {
            return Err(SubmitError::SimulatorDown);
        }
        let cfg = self.config();

        if !self.inner.endpoints.contains_key(&dst) {
            return Err(SubmitError::UnknownDestination(hex::encode(dst)));
        }

        let header = codec::peek_header(&encoded)?;
        let packet_id = Uuid::from_bytes(header.packet_id);

        let max = cfg.max_chunk_size_bytes;
        if encoded.len() > max && !cfg.auto_chunk_large_payloads {
            self.inner.stats.oversized_rejected();
            return Err(SubmitError::Oversized {
                len: encoded.len(),
                max,
            });
        }

        let chunk_count = encoded.len().div_ceil(max);
        if chunk_count > u16::MAX as usize {
            self.inner.stats.oversized_rejected();
            return Err(SubmitError::Oversized {
                len: encoded.len(),
                max: max * u16::MAX as usize,
            });
        }

        tracing::debug!(
            packet_id = %packet_id,
            len = encoded.len(),
            chunks = chunk_count,
            "packet admitted"
        );

        for index in 0..chunk_count {
            let body = encoded.slice(index * max..((index + 1) * max).min(encoded.len()));
            let frame = codec::encode_chunk(packet_id, index as u16, chunk_count as u16, &body);
            self.launch_chunk(&cfg, src, dst, packet_id, index as u16, frame);
        }

        Ok(())
    }

    /// Decide one chunk's fate and spawn its delivery (or NAK) task.
    fn launch_chunk(
        &self,
        cfg: &SimSettings,
        src: NodeId,
        dst: NodeId,
        packet_id: Uuid,
        chunk_index: u16,
        frame: Bytes,
    ) {
        // All randomness is drawn here, under the seeded RNG, so a given
        // seed and submission order reproduce exactly.
        let (lost, jitter_ms, reorder_ms) = {
            let mut rng = self.inner.rng.lock().expect("rng lock poisoned");
            let lost = cfg.loss_probability > 0.0 && rng.gen_bool(cfg.loss_probability.min(1.0));
            let jitter_ms = if cfg.latency_jitter_ms > 0 {
                rng.gen_range(0..=cfg.latency_jitter_ms)
            } else {
                0
            };
            let reorder_ms = if cfg.enable_reordering && cfg.reorder_window_ms > 0 {
                rng.gen_range(0..=cfg.reorder_window_ms)
            } else {
                0
            };
            (lost, jitter_ms, reorder_ms)
        };

        let base = Duration::from_millis(cfg.base_latency_ms);
        let inner = self.inner.clone();

        if lost {
            self.inner.stats.chunk_dropped();
            let nak_delay = base + Duration::from_millis(jitter_ms);
            tracing::debug!(packet_id = %packet_id, chunk_index, "chunk dropped");
            tokio::spawn(async move {
                tokio::time::sleep(nak_delay).await;
                inner.stats.nak_emitted();
                inner
                    .push_event(
                        &src,
                        LinkEvent::Nak {
                            packet_id,
                            chunk_index,
                        },
                    )
                    .await;
            });
            return;
        }

        self.inner.stats.chunk_sent();
        let pacing = {
            let mut bucket = self.inner.bucket.lock().expect("bucket lock poisoned");
            bucket.reserve(frame.len())
        };
        let delay =
            pacing + base + Duration::from_millis(jitter_ms) + Duration::from_millis(reorder_ms);
        let ack_delay = base;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.chunk_arrived(src, dst, frame, ack_delay).await;
        });
    }

    fn spawn_reassembly_sweeper(&self) {
        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::debug!("reassembly sweeper shutting down");
                        return;
                    }
                    _ = interval.tick() => {
                        let timeout = Duration::from_millis(
                            inner.config.read().expect("config lock poisoned").reassembly_timeout_ms,
                        );
                        inner.assemblies.retain(|(_, packet_id), assembly| {
                            let keep = assembly.started_at.elapsed() < timeout;
                            if !keep {
                                inner.stats.reassembly_expired();
                                tracing::debug!(
                                    packet_id = %packet_id,
                                    have = assembly.chunks.len(),
                                    want = assembly.chunk_count,
                                    "reassembly buffer expired"
                                );
                            }
                            keep
                        });
                    }
                }
            }
        });
    }
}

impl SimInner {
    async fn push_event(&self, node: &NodeId, event: LinkEvent) {
        let Some(tx) = self.endpoints.get(node).map(|e| e.value().clone()) else {
            tracing::trace!(node = hex::encode(node), "event for detached endpoint dropped");
            return;
        };
        if tx.send(event).await.is_err() {
            tracing::trace!(node = hex::encode(node), "endpoint receiver closed");
        }
    }

    /// A chunk survived the link: buffer it, and on completion deliver the
    /// reassembled packet and ACK the sender.
    async fn chunk_arrived(&self, src: NodeId, dst: NodeId, frame: Bytes, ack_delay: Duration) {
        let chunk = match codec::decode_chunk(&frame) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable chunk frame discarded");
                return;
            }
        };

        let key = (dst, chunk.packet_id);
        let complete = {
            let mut assembly = self.assemblies.entry(key).or_insert_with(|| Assembly {
                chunks: HashMap::new(),
                chunk_count: chunk.chunk_count,
                src,
                started_at: Instant::now(),
            });

            // A retransmission under a different max_chunk_size is a new
            // fragmentation generation; the stale buffer is unusable.
            if assembly.chunk_count != chunk.chunk_count {
                assembly.chunks.clear();
                assembly.chunk_count = chunk.chunk_count;
                assembly.started_at = Instant::now();
            }

            assembly.chunks.insert(chunk.chunk_index, chunk.body);
            assembly.chunks.len() == assembly.chunk_count as usize
        };

        if !complete {
            return;
        }

        let Some((_, assembly)) = self.assemblies.remove(&key) else {
            return; // lost a race with the sweeper
        };

        let mut reassembled = Vec::new();
        for index in 0..assembly.chunk_count {
            match assembly.chunks.get(&index) {
                Some(body) => reassembled.extend_from_slice(body),
                None => {
                    tracing::warn!(packet_id = %chunk.packet_id, index, "assembly hole, discarding");
                    return;
                }
            }
        }

        self.stats.packet_delivered();
        tracing::debug!(
            packet_id = %chunk.packet_id,
            len = reassembled.len(),
            chunks = assembly.chunk_count,
            "packet reassembled"
        );

        self.push_event(&dst, LinkEvent::Packet(Bytes::from(reassembled)))
            .await;

        self.stats.ack_emitted();
        let ack_src = assembly.src;
        let packet_id = chunk.packet_id;
        tokio::time::sleep(ack_delay).await;
        self.push_event(&ack_src, LinkEvent::Ack { packet_id }).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
