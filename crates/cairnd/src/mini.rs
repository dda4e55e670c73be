//! Mini hub — edge node serving user queries from cache, forwarding misses.
//!
//! The query path: cache check → encrypt QUERY → enqueue for reliable
//! delivery → wait on a per-packet oneshot up to the reply timeout. Replies
//! are correlated by packet id, never by arrival order. A caller that stops
//! waiting cancels only its own wait — the queue entry keeps running, and a
//! late capsule is still verified and cached.
//!
//! Background roles: I/O loop on link events, retransmit worker, manifest
//! gossip poller, TTL sweeper.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use cairn_core::capsule::{now_millis, KnowledgeCapsule};
use cairn_core::codec::{
    self, CapsuleRequestBody, CodecError, ManifestBody, QueryBody,
};
use cairn_core::config::MiniSettings;
use cairn_core::crypto::{question_hash, AeadKeychain, CryptoError};
use cairn_core::wire::{node_id, NodeId, PacketType, MAX_QUESTION_BYTES};
use cairn_netsim::{LinkEvent, NetSim};
use cairn_services::{
    AuthorityRegistry, CapsuleStore, EntrySnapshot, EntryStatus, HubMetrics, MetricsSnapshot,
    PersistError, RetransmitQueue, RetryPolicy, Similarity, StoreError, SyncEngine, SyncError,
};

use crate::workers::retransmit_worker;

// ── Public results ────────────────────────────────────────────────────────────

/// Outcome of a [`MiniHub::query`] call.
#[derive(Debug, Clone)]
pub enum QueryResult {
    /// Answered from the local cache; nothing touched the link.
    CacheHit(KnowledgeCapsule),
    /// A fresh capsule arrived from the main hub within the reply timeout.
    Fresh(KnowledgeCapsule),
    /// The reply timeout elapsed but delivery is still being retried.
    Queued(Uuid),
    /// Terminal for this call: machine-readable code plus human message.
    Unavailable { code: String, message: String },
}

impl QueryResult {
    fn unavailable(code: &str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Input validation and encoding failures, reported synchronously.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("question must not be empty")]
    EmptyQuestion,

    #[error("question of {0} bytes exceeds the {MAX_QUESTION_BYTES}-byte limit")]
    QuestionTooLarge(usize),

    #[error("no AEAD key registered for main hub {0}")]
    UnknownMainHub(String),

    #[error("failed to encode query: {0}")]
    Codec(#[from] CodecError),

    #[error("failed to serialize query body: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What the I/O loop hands a waiting `query` call.
enum ReplyOutcome {
    Capsule(KnowledgeCapsule),
    Error(String),
    Failed,
}

// ── Hub ───────────────────────────────────────────────────────────────────────

/// Handle to a running mini hub. Cheap to clone.
#[derive(Clone)]
pub struct MiniHub {
    inner: Arc<MiniInner>,
}

struct MiniInner {
    name: String,
    id: NodeId,
    main_hub_name: String,
    main_hub: NodeId,
    settings: MiniSettings,
    store: CapsuleStore,
    queue: RetransmitQueue,
    sync: SyncEngine,
    sim: NetSim,
    keychain: Arc<dyn AeadKeychain>,
    metrics: HubMetrics,
    similarity: Option<Arc<dyn Similarity>>,
    waiters: DashMap<Uuid, oneshot::Sender<ReplyOutcome>>,
    /// Outstanding selective-sync fetches: request packet id → capsule id.
    sync_requests: DashMap<Uuid, Uuid>,
    shutdown: broadcast::Sender<()>,
}

impl MiniHub {
    /// Attach to the simulator and spawn the hub's worker tasks.
    pub fn start(
        name: &str,
        settings: MiniSettings,
        store: CapsuleStore,
        authority: AuthorityRegistry,
        keychain: Arc<dyn AeadKeychain>,
        sim: NetSim,
        similarity: Option<Arc<dyn Similarity>>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(4);
        let queue = RetransmitQueue::new(RetryPolicy::from_settings(&settings));
        let sync = SyncEngine::new(store.clone(), authority, settings.max_inflight_sync);
        let id = node_id(name);
        let main_hub = node_id(&settings.main_hub);

        let inner = Arc::new(MiniInner {
            name: name.to_string(),
            id,
            main_hub_name: settings.main_hub.clone(),
            main_hub,
            settings,
            store,
            queue: queue.clone(),
            sync,
            sim: sim.clone(),
            keychain,
            metrics: HubMetrics::new(),
            similarity,
            waiters: DashMap::new(),
            sync_requests: DashMap::new(),
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
        tokio::spawn(gossip_loop(inner.clone()));
        tokio::spawn(sweep_loop(inner.clone()));

        tracing::info!(node = name, "mini hub started");
        Self { inner }
    }

    /// Answer a user question from cache, or forward it to the main hub.
    ///
    /// `hint` is a cache lookup hint only: it short-circuits the hash lookup
    /// when it names a fresh capsule for the same question, and is otherwise
    /// ignored.
    pub async fn query(
        &self,
        user_id: &str,
        question: &str,
        hint: Option<Uuid>,
    ) -> Result<QueryResult, QueryError> {
        let trimmed = question.trim();
        if trimmed.is_empty() {
            return Err(QueryError::EmptyQuestion);
        }
        if question.len() > MAX_QUESTION_BYTES {
            return Err(QueryError::QuestionTooLarge(question.len()));
        }
        self.inner.metrics.query_served();

        if let Some(capsule) = self.cache_lookup(question, hint) {
            tracing::debug!(node = %self.inner.name, user_id, "cache hit");
            return Ok(QueryResult::CacheHit(capsule));
        }

        let packet_id = Uuid::new_v4();
        let body = serde_json::to_vec(&QueryBody {
            question: question.to_string(),
            user_id: user_id.to_string(),
            reply_to: self.inner.name.clone(),
        })?;
        let key = self
            .inner
            .keychain
            .key_for(&self.inner.main_hub)
            .ok_or_else(|| QueryError::UnknownMainHub(self.inner.main_hub_name.clone()))?;
        let encoded = codec::encode_packet(
            PacketType::Query,
            packet_id,
            self.inner.id,
            self.inner.main_hub,
            &body,
            &key,
        )?;

        let (tx, rx) = oneshot::channel();
        self.inner.waiters.insert(packet_id, tx);
        self.inner
            .queue
            .enqueue(packet_id, self.inner.main_hub, encoded);

        tracing::info!(
            node = %self.inner.name,
            packet_id = %packet_id,
            user_id,
            "query forwarded to main hub"
        );

        let reply_timeout = Duration::from_millis(self.inner.settings.reply_timeout_ms);
        match tokio::time::timeout(reply_timeout, rx).await {
            Ok(Ok(ReplyOutcome::Capsule(capsule))) => Ok(QueryResult::Fresh(capsule)),
            Ok(Ok(ReplyOutcome::Error(code))) => Ok(QueryResult::unavailable(
                &code,
                "main hub reported an answer failure",
            )),
            Ok(Ok(ReplyOutcome::Failed)) => Ok(QueryResult::unavailable(
                "offline",
                "delivery failed after the retry cap",
            )),
            Ok(Err(_)) => Ok(QueryResult::unavailable("shutdown", "hub is shutting down")),
            Err(_) => {
                // Cancel only the user-visible wait; the entry keeps
                // retrying and a late capsule is still cached.
                self.inner.waiters.remove(&packet_id);
                match self.inner.queue.status(&packet_id) {
                    Some(EntryStatus::Failed) => Ok(QueryResult::unavailable(
                        "offline",
                        "delivery failed after the retry cap",
                    )),
                    _ => Ok(QueryResult::Queued(packet_id)),
                }
            }
        }
    }

    fn cache_lookup(&self, question: &str, hint: Option<Uuid>) -> Option<KnowledgeCapsule> {
        if let Some(hint_id) = hint {
            if let Some(capsule) = self.inner.store.get(&hint_id) {
                if capsule.question_hash == question_hash(question)
                    && capsule.is_fresh(now_millis())
                {
                    return Some(capsule);
                }
            }
        }
        if let Some(capsule) = self.inner.store.find_by_question(question) {
            return Some(capsule);
        }
        let similarity = self.inner.similarity.as_ref()?;
        self.inner.store.find_similar(
            question,
            similarity.as_ref(),
            self.inner.settings.similarity_threshold,
        )
    }

    pub fn list_capsules(&self) -> Vec<KnowledgeCapsule> {
        self.inner.store.list()
    }

    pub fn get_capsule(&self, capsule_id: &Uuid) -> Option<KnowledgeCapsule> {
        self.inner.store.get(capsule_id)
    }

    pub fn queue_snapshot(&self, packet_id: &Uuid) -> Option<EntrySnapshot> {
        self.inner.queue.snapshot(packet_id)
    }

    pub fn queue_snapshots(&self) -> Vec<EntrySnapshot> {
        self.inner.queue.snapshots()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Snapshot live queue entries so they resume after a restart.
    pub fn persist_queue(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<usize, PersistError> {
        self.inner.queue.persist(path)
    }

    /// Reload a persisted queue snapshot.
    pub fn restore_queue(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<usize, PersistError> {
        self.inner.queue.restore(path)
    }

    /// Stop all worker tasks. In-flight waits resolve as `shutdown`.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn io_loop(
    inner: Arc<MiniInner>,
    mut events: mpsc::Receiver<LinkEvent>,
    mut failed_rx: mpsc::Receiver<Uuid>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(node = %inner.name, "mini io loop shutting down");
                return;
            }
            Some(packet_id) = failed_rx.recv() => {
                on_entry_failed(&inner, packet_id);
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

fn handle_event(inner: &Arc<MiniInner>, event: LinkEvent) {
    match event {
        LinkEvent::Ack { packet_id } => {
            let outcome = inner.queue.on_ack(packet_id);
            if outcome.reconciled > 0 {
                tracing::info!(
                    node = %inner.name,
                    reconciled = outcome.reconciled,
                    "link recovered, draining queue"
                );
            }
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
                PacketType::Capsule => handle_capsule(inner, decoded.packet_id, &decoded.plaintext),
                PacketType::Manifest => handle_manifest(inner, decoded.src, &decoded.plaintext),
                other => {
                    tracing::trace!(node = %inner.name, ?other, "packet type ignored by mini hub");
                }
            }
        }
    }
}

fn handle_capsule(inner: &Arc<MiniInner>, packet_id: Uuid, plaintext: &[u8]) {
    let capsule = match KnowledgeCapsule::from_bytes(plaintext) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(node = %inner.name, error = %e, "malformed capsule payload");
            return;
        }
    };

    if let Some(code) = capsule.error_code.clone() {
        // Error capsules surface to the waiting caller and are never cached.
        inner.queue.on_ack(packet_id);
        finish_sync_request(inner, packet_id, None);
        if let Some((_, tx)) = inner.waiters.remove(&packet_id) {
            let _ = tx.send(ReplyOutcome::Error(code));
        }
        return;
    }

    match inner.store.put(&capsule) {
        Ok(cairn_services::PutOutcome::Inserted) => {
            inner.metrics.capsule_stored();
            tracing::info!(
                node = %inner.name,
                capsule_id = %capsule.capsule_id,
                source_id = %capsule.source_id,
                "capsule accepted"
            );
        }
        Ok(cairn_services::PutOutcome::AlreadyPresent) => {}
        Err(StoreError::SigInvalid(source)) => {
            inner.metrics.sig_invalid();
            tracing::warn!(node = %inner.name, source, "capsule signature invalid, rejected");
            return;
        }
        Err(StoreError::UnknownSigner(source)) => {
            inner.metrics.unknown_signer();
            tracing::warn!(node = %inner.name, source, "capsule from unknown signer, rejected");
            return;
        }
        Err(e) => {
            tracing::error!(node = %inner.name, error = %e, "capsule store failure");
            return;
        }
    }

    // The reply doubles as delivery confirmation for the request.
    inner.queue.on_ack(packet_id);
    finish_sync_request(inner, packet_id, Some(&capsule.capsule_id));

    if let Some((_, tx)) = inner.waiters.remove(&packet_id) {
        let _ = tx.send(ReplyOutcome::Capsule(capsule));
    }
}

fn handle_manifest(inner: &Arc<MiniInner>, src: NodeId, plaintext: &[u8]) {
    let body: ManifestBody = match serde_json::from_slice(plaintext) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(node = %inner.name, error = %e, "malformed manifest payload");
            return;
        }
    };
    let ManifestBody::Publish { manifest } = body else {
        return; // polls are a main-hub concern
    };

    match inner.sync.offer(&manifest, src) {
        Ok(queued) => {
            if queued > 0 {
                tracing::info!(node = %inner.name, queued, source_id = %manifest.source_id, "manifest applied");
            }
            pump_sync(inner);
        }
        Err(SyncError::UnknownSigner(source)) => {
            inner.metrics.unknown_signer();
            tracing::warn!(node = %inner.name, source, "manifest from unknown signer, rejected");
        }
        Err(SyncError::SigInvalid(source)) => {
            inner.metrics.sig_invalid();
            tracing::warn!(node = %inner.name, source, "manifest signature invalid, rejected");
        }
    }
}

/// Turn ready sync fetches into CAPSULE_REQUEST packets on the queue.
fn pump_sync(inner: &Arc<MiniInner>) {
    for (peer, capsule_id) in inner.sync.take_ready() {
        let Some(key) = inner.keychain.key_for(&peer) else {
            tracing::warn!(node = %inner.name, "no AEAD key for sync peer, fetch dropped");
            inner.sync.fail(&capsule_id);
            continue;
        };
        let packet_id = Uuid::new_v4();
        let body = match serde_json::to_vec(&CapsuleRequestBody { capsule_id }) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(node = %inner.name, error = %e, "capsule request serialization failed");
                inner.sync.fail(&capsule_id);
                continue;
            }
        };
        match codec::encode_packet(
            PacketType::CapsuleRequest,
            packet_id,
            inner.id,
            peer,
            &body,
            &key,
        ) {
            Ok(encoded) => {
                inner.sync_requests.insert(packet_id, capsule_id);
                inner.queue.enqueue(packet_id, peer, encoded);
                tracing::debug!(
                    node = %inner.name,
                    capsule_id = %capsule_id,
                    packet_id = %packet_id,
                    "capsule fetch requested"
                );
            }
            Err(e) => {
                tracing::warn!(node = %inner.name, error = %e, "capsule request encoding failed");
                inner.sync.fail(&capsule_id);
            }
        }
    }
}

fn finish_sync_request(inner: &Arc<MiniInner>, packet_id: Uuid, delivered: Option<&Uuid>) {
    if let Some((_, requested)) = inner.sync_requests.remove(&packet_id) {
        match delivered {
            Some(id) if *id == requested => {
                inner.sync.complete(&requested);
            }
            _ => {
                inner.sync.fail(&requested);
            }
        }
        pump_sync(inner);
    } else if let Some(id) = delivered {
        // A capsule that arrived another way may satisfy an outstanding fetch.
        if inner.sync.complete(id) {
            pump_sync(inner);
        }
    }
}

fn on_entry_failed(inner: &Arc<MiniInner>, packet_id: Uuid) {
    tracing::warn!(node = %inner.name, packet_id = %packet_id, "queue entry failed terminally");
    if let Some((_, tx)) = inner.waiters.remove(&packet_id) {
        let _ = tx.send(ReplyOutcome::Failed);
    }
    if let Some((_, capsule_id)) = inner.sync_requests.remove(&packet_id) {
        inner.sync.fail(&capsule_id);
        pump_sync(inner);
    }
}

/// Periodically poll the main hub for its latest manifest. Push-driven
/// manifests cover the common case; this poll closes the gap when pushes
/// are lost.
async fn gossip_loop(inner: Arc<MiniInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut interval =
        tokio::time::interval(Duration::from_millis(inner.settings.gossip_interval_ms.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // the startup tick; polling starts one interval in

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(node = %inner.name, "gossip poller shutting down");
                return;
            }
            _ = interval.tick() => {
                poll_manifest(&inner);
            }
        }
    }
}

fn poll_manifest(inner: &Arc<MiniInner>) {
    let Some(key) = inner.keychain.key_for(&inner.main_hub) else {
        return;
    };
    let body = match serde_json::to_vec(&ManifestBody::Poll) {
        Ok(b) => b,
        Err(_) => return,
    };
    let packet_id = Uuid::new_v4();
    match codec::encode_packet(
        PacketType::Manifest,
        packet_id,
        inner.id,
        inner.main_hub,
        &body,
        &key,
    ) {
        // Polls are fire-and-forget: a lost poll is covered by the next tick.
        Ok(encoded) => match inner.sim.submit(inner.id, inner.main_hub, encoded) {
            Ok(()) => tracing::debug!(node = %inner.name, "manifest poll sent"),
            Err(e) => tracing::debug!(node = %inner.name, error = %e, "manifest poll not sent"),
        },
        Err(e) => tracing::warn!(node = %inner.name, error = %e, "manifest poll encoding failed"),
    }
}

async fn sweep_loop(inner: Arc<MiniInner>) {
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
