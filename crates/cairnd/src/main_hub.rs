//! Main hub — authoritative capsule generator and manifest publisher.
//!
//! Decrypted QUERY frames flow through a fixed pipeline: packet-id dedup
//! (idempotent resend within the window) → own-store reuse by question hash
//! → the injected answer generator → bind, sign, store, reply. The reply
//! reuses the query's packet id, which is how the asking mini hub correlates
//! it. Answer failures still produce a signed capsule — an ERROR capsule the
//! receiver surfaces but never caches.
//!
//! Manifests are pushed to every known peer on a fixed interval and served
//! on demand to pollers; CAPSULE_REQUESTs are answered from the store.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use cairn_core::capsule::KnowledgeCapsule;
use cairn_core::codec::{self, CapsuleRequestBody, CodecError, ManifestBody, QueryBody};
use cairn_core::config::MainSettings;
use cairn_core::crypto::{AeadKeychain, CryptoError, SigningIdentity};
use cairn_core::manifest::Manifest;
use cairn_core::wire::{node_id, NodeId, PacketType};
use cairn_netsim::{LinkEvent, NetSim};
use cairn_services::{
    CapsuleStore, HubMetrics, MetricsSnapshot, PutOutcome, RetransmitQueue, RetryPolicy,
};

use crate::answer::AnswerProvider;
use crate::keychain::PresharedKeychain;
use crate::workers::retransmit_worker;

/// Handle to a running main hub. Cheap to clone.
#[derive(Clone)]
pub struct MainHub {
    inner: Arc<MainInner>,
}

struct MainInner {
    /// Canonical node name; doubles as the capsule `source_id`.
    name: String,
    id: NodeId,
    settings: MainSettings,
    signer: SigningIdentity,
    store: CapsuleStore,
    queue: RetransmitQueue,
    answer: Arc<dyn AnswerProvider>,
    keychain: Arc<PresharedKeychain>,
    sim: NetSim,
    metrics: HubMetrics,
    /// Idempotent-response window: query packet id → the capsule it got.
    dedup: DashMap<Uuid, DedupRecord>,
    shutdown: broadcast::Sender<()>,
}

struct DedupRecord {
    capsule: KnowledgeCapsule,
    at: Instant,
}

impl MainHub {
    /// Attach to the simulator and spawn the hub's worker tasks.
    pub fn start(
        name: &str,
        settings: MainSettings,
        reply_policy: RetryPolicy,
        store: CapsuleStore,
        signer: SigningIdentity,
        answer: Arc<dyn AnswerProvider>,
        keychain: Arc<PresharedKeychain>,
        sim: NetSim,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(4);
        let queue = RetransmitQueue::new(reply_policy);
        let id = node_id(name);

        let inner = Arc::new(MainInner {
            name: name.to_string(),
            id,
            settings,
            signer,
            store,
            queue: queue.clone(),
            answer,
            keychain,
            sim: sim.clone(),
            metrics: HubMetrics::new(),
            dedup: DashMap::new(),
            shutdown: shutdown.clone(),
        });

        let events = sim.attach(id);
        let (failed_tx, failed_rx) = mpsc::channel(64);

        tokio::spawn(io_loop(inner.clone(), events, failed_rx));
        tokio::spawn(retransmit_worker(
            id,
            queue,
            sim,
            inner.metrics.clone(),
            failed_tx,
            shutdown.subscribe(),
        ));
        tokio::spawn(manifest_loop(inner.clone()));
        tokio::spawn(sweep_loop(inner.clone()));

        tracing::info!(node = name, "main hub started");
        Self { inner }
    }

    /// The current signed manifest, regenerated on demand.
    pub fn latest_manifest(&self) -> Manifest {
        self.inner
            .store
            .manifest(&self.inner.name, &self.inner.signer)
    }

    pub fn get_capsule(&self, capsule_id: &Uuid) -> Option<KnowledgeCapsule> {
        self.inner.store.get(capsule_id)
    }

    /// The verifying key mini hubs must register for this source.
    pub fn verifying_key(&self) -> [u8; 32] {
        self.inner.signer.verifying_key()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Push the current manifest to every known peer now, without waiting
    /// for the interval.
    pub fn publish_manifest(&self) {
        publish_to_all(&self.inner);
    }

    /// Stop all worker tasks.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn io_loop(
    inner: Arc<MainInner>,
    mut events: mpsc::Receiver<LinkEvent>,
    mut failed_rx: mpsc::Receiver<Uuid>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(node = %inner.name, "main io loop shutting down");
                return;
            }
            Some(packet_id) = failed_rx.recv() => {
                tracing::warn!(node = %inner.name, packet_id = %packet_id, "reply delivery failed terminally");
            }
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::warn!(node = %inner.name, "link event channel closed");
                    return;
                };
                handle_event(&inner, event);
            }
        }
    }
}

fn handle_event(inner: &Arc<MainInner>, event: LinkEvent) {
    match event {
        LinkEvent::Ack { packet_id } => {
            inner.queue.on_ack(packet_id);
        }
        LinkEvent::Nak {
            packet_id,
            chunk_index,
        } => {
            inner.queue.on_nak(packet_id, chunk_index);
        }
        LinkEvent::Packet(bytes) => {
            let decoded = match codec::decode_packet(&bytes, inner.keychain.as_ref()) {
                Ok(d) => d,
                Err(CodecError::Crypto(CryptoError::DecryptFail)) => {
                    inner.metrics.decrypt_fail();
                    tracing::warn!(node = %inner.name, "packet decryption failed, dropped");
                    return;
                }
                Err(CodecError::UnknownPeer(peer)) => {
                    inner.metrics.decrypt_fail();
                    tracing::warn!(node = %inner.name, peer, "packet from unkeyed peer, dropped");
                    return;
                }
                Err(e) => {
                    tracing::warn!(node = %inner.name, error = %e, "undecodable packet dropped");
                    return;
                }
            };
            match decoded.packet_type {
                PacketType::Query => {
                    handle_query(inner, decoded.packet_id, decoded.src, &decoded.plaintext)
                }
                PacketType::CapsuleRequest => {
                    handle_capsule_request(inner, decoded.packet_id, decoded.src, &decoded.plaintext)
                }
                PacketType::Manifest => {
                    handle_manifest_poll(inner, decoded.packet_id, decoded.src, &decoded.plaintext)
                }
                other => {
                    tracing::trace!(node = %inner.name, ?other, "packet type ignored by main hub");
                }
            }
        }
    }
}

/// Query pipeline: dedup, reuse, generate, sign, store, reply.
fn handle_query(inner: &Arc<MainInner>, packet_id: Uuid, src: NodeId, plaintext: &[u8]) {
    let body: QueryBody = match serde_json::from_slice(plaintext) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(node = %inner.name, error = %e, "malformed query payload");
            return;
        }
    };
    inner.metrics.query_served();

    let window = Duration::from_secs(inner.settings.dedup_window_secs);
    if let Some(record) = inner.dedup.get(&packet_id) {
        if record.at.elapsed() < window {
            tracing::debug!(
                node = %inner.name,
                packet_id = %packet_id,
                "duplicate query, resending capsule"
            );
            let capsule = record.capsule.clone();
            drop(record);
            send_capsule(inner, packet_id, src, &capsule);
            return;
        }
    }

    let capsule = match inner.store.find_by_question(&body.question) {
        Some(existing) => {
            tracing::debug!(
                node = %inner.name,
                capsule_id = %existing.capsule_id,
                "reusing fresh capsule"
            );
            existing
        }
        None => match inner.answer.answer(&body.question) {
            Ok(text) => {
                let capsule = KnowledgeCapsule::create(
                    &body.question,
                    text,
                    &inner.name,
                    inner.settings.capsule_ttl_secs,
                    &inner.signer,
                );
                match inner.store.put(&capsule) {
                    Ok(PutOutcome::Inserted) => {
                        inner.metrics.capsule_stored();
                        tracing::info!(
                            node = %inner.name,
                            capsule_id = %capsule.capsule_id,
                            user_id = %body.user_id,
                            "capsule generated"
                        );
                        capsule
                    }
                    Ok(PutOutcome::AlreadyPresent) => capsule,
                    Err(e) => {
                        // A capsule that is not durable must never be
                        // acknowledged to the asker.
                        tracing::error!(node = %inner.name, error = %e, "capsule not durable, reply withheld");
                        return;
                    }
                }
            }
            Err(e) => {
                inner.metrics.answer_fail();
                tracing::warn!(node = %inner.name, error = %e, "answer generation failed");
                KnowledgeCapsule::create_error(&body.question, "answer_fail", &inner.name, &inner.signer)
            }
        },
    };

    inner.dedup.insert(
        packet_id,
        DedupRecord {
            capsule: capsule.clone(),
            at: Instant::now(),
        },
    );
    send_capsule(inner, packet_id, src, &capsule);
}

fn handle_capsule_request(inner: &Arc<MainInner>, packet_id: Uuid, src: NodeId, plaintext: &[u8]) {
    let body: CapsuleRequestBody = match serde_json::from_slice(plaintext) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(node = %inner.name, error = %e, "malformed capsule request");
            return;
        }
    };
    match inner.store.get(&body.capsule_id) {
        Some(capsule) => send_capsule(inner, packet_id, src, &capsule),
        None => {
            tracing::debug!(
                node = %inner.name,
                capsule_id = %body.capsule_id,
                "requested capsule not held"
            );
        }
    }
}

fn handle_manifest_poll(inner: &Arc<MainInner>, packet_id: Uuid, src: NodeId, plaintext: &[u8]) {
    match serde_json::from_slice::<ManifestBody>(plaintext) {
        Ok(ManifestBody::Poll) => {
            publish_to(inner, src, packet_id);
        }
        Ok(ManifestBody::Publish { .. }) => {} // peers do not publish to us
        Err(e) => {
            tracing::warn!(node = %inner.name, error = %e, "malformed manifest payload");
        }
    }
}

/// Encrypt a capsule for `dst` and hand it to the retransmit queue. The
/// reply deliberately reuses the originating packet id.
fn send_capsule(inner: &Arc<MainInner>, packet_id: Uuid, dst: NodeId, capsule: &KnowledgeCapsule) {
    let Some(key) = inner.keychain.key_for(&dst) else {
        tracing::warn!(node = %inner.name, "no AEAD key for capsule destination, reply dropped");
        return;
    };
    let body = match capsule.to_bytes() {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(node = %inner.name, error = %e, "capsule serialization failed");
            return;
        }
    };
    match codec::encode_packet(PacketType::Capsule, packet_id, inner.id, dst, &body, &key) {
        Ok(encoded) => {
            inner.queue.enqueue(packet_id, dst, encoded);
        }
        Err(e) => {
            tracing::error!(node = %inner.name, error = %e, "capsule encoding failed");
        }
    }
}

/// Periodic manifest push and dedup-window pruning.
async fn manifest_loop(inner: Arc<MainInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut interval = tokio::time::interval(Duration::from_millis(
        inner.settings.manifest_interval_ms.max(1),
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(node = %inner.name, "manifest publisher shutting down");
                return;
            }
            _ = interval.tick() => {
                publish_to_all(&inner);
                prune_dedup(&inner);
            }
        }
    }
}

fn publish_to_all(inner: &Arc<MainInner>) {
    let peers = inner.keychain.peers();
    for (peer, peer_name) in peers {
        if peer == inner.id {
            continue;
        }
        publish_to(inner, peer, Uuid::new_v4());
        tracing::debug!(node = %inner.name, peer = %peer_name, "manifest pushed");
    }
}

/// Manifests are fire-and-forget: loss is covered by the next interval and
/// by receiver polling, so they bypass the retransmit queue.
fn publish_to(inner: &Arc<MainInner>, dst: NodeId, packet_id: Uuid) {
    let Some(key) = inner.keychain.key_for(&dst) else {
        return;
    };
    let manifest = inner.store.manifest(&inner.name, &inner.signer);
    let body = match serde_json::to_vec(&ManifestBody::Publish { manifest }) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(node = %inner.name, error = %e, "manifest serialization failed");
            return;
        }
    };
    match codec::encode_packet(PacketType::Manifest, packet_id, inner.id, dst, &body, &key) {
        Ok(encoded) => {
            if let Err(e) = inner.sim.submit(inner.id, dst, encoded) {
                tracing::debug!(node = %inner.name, error = %e, "manifest not sent");
            }
        }
        Err(e) => {
            tracing::error!(node = %inner.name, error = %e, "manifest encoding failed");
        }
    }
}

fn prune_dedup(inner: &Arc<MainInner>) {
    let window = Duration::from_secs(inner.settings.dedup_window_secs);
    inner.dedup.retain(|_, record| record.at.elapsed() < window);
}

async fn sweep_loop(inner: Arc<MainInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut interval =
        tokio::time::interval(Duration::from_millis(inner.settings.sweep_interval_ms.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {
                match inner.store.sweep() {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(node = %inner.name, swept = n, "expired capsules removed"),
                    Err(e) => tracing::error!(node = %inner.name, error = %e, "capsule sweep failed"),
                }
                inner.queue.purge_completed();
            }
        }
    }
}
