//! Manifest-driven selective sync.
//!
//! A verified manifest is diffed against the local store; capsules the node
//! is missing are queued for fetch. At most `max_inflight` CAPSULE_REQUESTs
//! are outstanding per peer — the rest wait in line and are released as
//! fetches complete or fail. Stale manifests (older `generated_at` than one
//! already seen from that source) are ignored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use cairn_core::manifest::Manifest;
use cairn_core::wire::NodeId;

use crate::authority::AuthorityRegistry;
use crate::store::CapsuleStore;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no authority registered for manifest source {0}")]
    UnknownSigner(String),

    #[error("manifest signature invalid for source {0}")]
    SigInvalid(String),
}

/// Shared sync state for one hub. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    store: CapsuleStore,
    authority: AuthorityRegistry,
    max_inflight: usize,
    /// Newest `generated_at` seen per source — stale manifests are dropped.
    latest_seen: DashMap<String, DateTime<Utc>>,
    /// Fetches waiting for an inflight slot.
    waiting: Mutex<VecDeque<(NodeId, Uuid)>>,
    /// Fetches currently on the wire: capsule_id → peer.
    outstanding: DashMap<Uuid, NodeId>,
}

impl SyncEngine {
    pub fn new(store: CapsuleStore, authority: AuthorityRegistry, max_inflight: usize) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                store,
                authority,
                max_inflight: max_inflight.max(1),
                latest_seen: DashMap::new(),
                waiting: Mutex::new(VecDeque::new()),
                outstanding: DashMap::new(),
            }),
        }
    }

    /// Verify a received manifest and queue fetches for every capsule the
    /// local store is missing. Returns how many fetches were queued.
    pub fn offer(&self, manifest: &Manifest, from: NodeId) -> Result<usize, SyncError> {
        let key = self
            .inner
            .authority
            .verifying_key(&manifest.source_id)
            .ok_or_else(|| SyncError::UnknownSigner(manifest.source_id.clone()))?;
        manifest
            .verify(&key)
            .map_err(|_| SyncError::SigInvalid(manifest.source_id.clone()))?;

        // Newest generated_at from any trusted signer wins; replays of an
        // older manifest carry no new information.
        if let Some(seen) = self.inner.latest_seen.get(&manifest.source_id) {
            if manifest.generated_at <= *seen {
                tracing::trace!(source_id = %manifest.source_id, "stale manifest ignored");
                return Ok(0);
            }
        }
        self.inner
            .latest_seen
            .insert(manifest.source_id.clone(), manifest.generated_at);

        let mut waiting = self.inner.waiting.lock().expect("sync lock poisoned");
        let mut queued = 0usize;
        for capsule_id in manifest.capsule_ids() {
            if self.inner.store.contains(&capsule_id)
                || self.inner.outstanding.contains_key(&capsule_id)
                || waiting.iter().any(|(_, id)| *id == capsule_id)
            {
                continue;
            }
            waiting.push_back((from, capsule_id));
            queued += 1;
        }
        drop(waiting);

        if queued > 0 {
            tracing::info!(
                source_id = %manifest.source_id,
                queued,
                "manifest diff queued capsule fetches"
            );
        }
        Ok(queued)
    }

    /// Release fetches up to the per-peer inflight cap. Each returned pair
    /// must be turned into a CAPSULE_REQUEST by the caller; the slot stays
    /// held until `complete` or `fail`.
    pub fn take_ready(&self) -> Vec<(NodeId, Uuid)> {
        let mut waiting = self.inner.waiting.lock().expect("sync lock poisoned");
        let mut ready = Vec::new();
        let mut deferred = VecDeque::new();

        while let Some((peer, capsule_id)) = waiting.pop_front() {
            if self.inner.store.contains(&capsule_id) {
                continue; // arrived some other way while waiting
            }
            let inflight = self
                .inner
                .outstanding
                .iter()
                .filter(|e| *e.value() == peer)
                .count();
            if inflight >= self.inner.max_inflight {
                deferred.push_back((peer, capsule_id));
                continue;
            }
            self.inner.outstanding.insert(capsule_id, peer);
            ready.push((peer, capsule_id));
        }

        *waiting = deferred;
        ready
    }

    /// A requested capsule arrived (or was obtained elsewhere); free its slot.
    pub fn complete(&self, capsule_id: &Uuid) -> bool {
        self.inner.outstanding.remove(capsule_id).is_some()
    }

    /// A fetch failed terminally; free the slot. The next manifest offer
    /// will queue the capsule again.
    pub fn fail(&self, capsule_id: &Uuid) -> bool {
        self.inner.outstanding.remove(capsule_id).is_some()
    }

    pub fn outstanding_count(&self, peer: &NodeId) -> usize {
        self.inner
            .outstanding
            .iter()
            .filter(|e| e.value() == peer)
            .count()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.waiting.lock().expect("sync lock poisoned").len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
