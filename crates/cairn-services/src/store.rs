//! Capsule store — the signed Q/A cache every hub carries.
//!
//! Append-only by capsule identity: a capsule is verified once on the way
//! in, then never changes. Reads are served from an in-memory index and
//! never block each other; writes go through SQLite first so an
//! acknowledged capsule survives a restart, then update the index.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection};
use uuid::Uuid;

use cairn_core::capsule::{now_millis, KnowledgeCapsule};
use cairn_core::crypto::SigningIdentity;
use cairn_core::manifest::{Manifest, ManifestEntry};

use crate::authority::AuthorityRegistry;
use crate::similarity::Similarity;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS capsules (
    capsule_id    TEXT PRIMARY KEY,
    question_text TEXT NOT NULL,
    answer_text   TEXT NOT NULL,
    question_hash TEXT NOT NULL,
    source_id     TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    ttl_seconds   INTEGER NOT NULL,
    signature     TEXT NOT NULL,
    received_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_capsules_question_hash ON capsules(question_hash);
";

/// Result of a successful `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The capsule was new and is now durable.
    Inserted,
    /// The capsule id was already present; the earlier record wins.
    AlreadyPresent,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no authority registered for source {0}")]
    UnknownSigner(String),

    #[error("capsule signature invalid for source {0}")]
    SigInvalid(String),

    #[error("capsule id {0} already registered to source {1}")]
    IdCollision(Uuid, String),

    #[error("store I/O failure: {0}")]
    Io(#[from] rusqlite::Error),

    #[error("corrupt capsule row: {0}")]
    Corrupt(String),
}

/// Shared capsule store. Cheap to clone.
#[derive(Clone)]
pub struct CapsuleStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    by_id: DashMap<Uuid, KnowledgeCapsule>,
    by_question: DashMap<[u8; 32], Vec<Uuid>>,
    authority: AuthorityRegistry,
}

impl CapsuleStore {
    /// Open (or create) a store backed by a SQLite file.
    pub fn open(path: impl AsRef<Path>, authority: AuthorityRegistry) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, authority)
    }

    /// An in-memory store: full semantics, no durability. Test use mostly.
    pub fn in_memory(authority: AuthorityRegistry) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, authority)
    }

    fn from_connection(conn: Connection, authority: AuthorityRegistry) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                by_id: DashMap::new(),
                by_question: DashMap::new(),
                authority,
            }),
        };
        store.load_index()?;
        Ok(store)
    }

    /// Rebuild the in-memory index from the durable rows.
    fn load_index(&self) -> Result<(), StoreError> {
        let conn = self.inner.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT capsule_id, question_text, answer_text, question_hash, source_id,
                    created_at, ttl_seconds, signature
             FROM capsules",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut loaded = 0usize;
        for row in rows {
            let (id, question_text, answer_text, hash_hex, source_id, created_ms, ttl, sig_hex) =
                row?;
            let capsule = row_to_capsule(
                &id,
                question_text,
                answer_text,
                &hash_hex,
                source_id,
                created_ms,
                ttl,
                &sig_hex,
            )?;
            self.index(&capsule);
            loaded += 1;
        }
        if loaded > 0 {
            tracing::info!(count = loaded, "capsule store index loaded");
        }
        Ok(())
    }

    /// Verify and store a capsule.
    ///
    /// Verification order is fixed: registered signer, valid signature,
    /// then identity checks. A capsule id registered to a different source
    /// is rejected; the same capsule twice is a no-op (earlier record wins).
    /// The SQLite insert commits before the index updates, so `Inserted`
    /// implies durable.
    pub fn put(&self, capsule: &KnowledgeCapsule) -> Result<PutOutcome, StoreError> {
        let key = self
            .inner
            .authority
            .verifying_key(&capsule.source_id)
            .ok_or_else(|| StoreError::UnknownSigner(capsule.source_id.clone()))?;
        capsule
            .verify(&key)
            .map_err(|_| StoreError::SigInvalid(capsule.source_id.clone()))?;

        if let Some(existing) = self.inner.by_id.get(&capsule.capsule_id) {
            if existing.source_id != capsule.source_id {
                return Err(StoreError::IdCollision(
                    capsule.capsule_id,
                    existing.source_id.clone(),
                ));
            }
            return Ok(PutOutcome::AlreadyPresent);
        }

        {
            let conn = self.inner.conn.lock().expect("store lock poisoned");
            conn.execute(
                "INSERT OR IGNORE INTO capsules
                 (capsule_id, question_text, answer_text, question_hash, source_id,
                  created_at, ttl_seconds, signature, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    capsule.capsule_id.to_string(),
                    capsule.question_text,
                    capsule.answer_text,
                    hex::encode(capsule.question_hash),
                    capsule.source_id,
                    capsule.created_at.timestamp_millis(),
                    capsule.ttl_seconds as i64,
                    hex::encode(capsule.signature),
                    now_millis().timestamp_millis(),
                ],
            )?;
        }

        self.index(capsule);
        tracing::debug!(
            capsule_id = %capsule.capsule_id,
            source_id = %capsule.source_id,
            "capsule stored"
        );
        Ok(PutOutcome::Inserted)
    }

    fn index(&self, capsule: &KnowledgeCapsule) {
        self.inner
            .by_question
            .entry(capsule.question_hash)
            .or_default()
            .push(capsule.capsule_id);
        self.inner
            .by_id
            .insert(capsule.capsule_id, capsule.clone());
    }

    /// O(1) lookup by capsule id.
    pub fn get(&self, capsule_id: &Uuid) -> Option<KnowledgeCapsule> {
        self.inner.by_id.get(capsule_id).map(|c| c.clone())
    }

    pub fn contains(&self, capsule_id: &Uuid) -> bool {
        self.inner.by_id.contains_key(capsule_id)
    }

    pub fn len(&self) -> usize {
        self.inner.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.by_id.is_empty()
    }

    pub fn list(&self) -> Vec<KnowledgeCapsule> {
        self.inner.by_id.iter().map(|e| e.value().clone()).collect()
    }

    /// The newest fresh capsule whose question hash matches, else None.
    pub fn find_by_question(&self, question: &str) -> Option<KnowledgeCapsule> {
        let hash = cairn_core::crypto::question_hash(question);
        let now = now_millis();
        let ids = self.inner.by_question.get(&hash)?;
        ids.iter()
            .filter_map(|id| self.inner.by_id.get(id).map(|c| c.clone()))
            .filter(|c| c.is_fresh(now))
            .max_by_key(|c| c.created_at)
    }

    /// Widened lookup through an injected similarity capability.
    ///
    /// The deterministic hash path is authoritative; this only runs after
    /// it misses, and only accepts candidates at or above `threshold`.
    pub fn find_similar(
        &self,
        question: &str,
        similarity: &dyn Similarity,
        threshold: f64,
    ) -> Option<KnowledgeCapsule> {
        let now = now_millis();
        self.inner
            .by_id
            .iter()
            .filter(|e| e.value().is_fresh(now))
            .map(|e| {
                let score = similarity.score(question, &e.value().question_text);
                (score, e.value().clone())
            })
            .filter(|(score, _)| *score >= threshold)
            .max_by(|(a, ca), (b, cb)| {
                a.partial_cmp(b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(ca.created_at.cmp(&cb.created_at))
            })
            .map(|(_, capsule)| capsule)
    }

    /// Signed manifest of every fresh capsule, ordered by creation time.
    pub fn manifest(&self, source_id: &str, signer: &SigningIdentity) -> Manifest {
        let now = now_millis();
        let entries: Vec<ManifestEntry> = self
            .inner
            .by_id
            .iter()
            .filter(|e| e.value().is_fresh(now))
            .map(|e| ManifestEntry {
                capsule_id: e.value().capsule_id,
                question_hash: e.value().question_hash,
                created_at: e.value().created_at,
            })
            .collect();
        Manifest::build(source_id, entries, signer)
    }

    /// Remove expired capsules. Returns how many were dropped.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let expired: Vec<Uuid> = self
            .inner
            .by_id
            .iter()
            .filter(|e| !e.value().is_fresh(now))
            .map(|e| *e.key())
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        {
            let conn = self.inner.conn.lock().expect("store lock poisoned");
            for id in &expired {
                conn.execute(
                    "DELETE FROM capsules WHERE capsule_id = ?1",
                    params![id.to_string()],
                )?;
            }
        }

        for id in &expired {
            if let Some((_, capsule)) = self.inner.by_id.remove(id) {
                if let Some(mut ids) = self.inner.by_question.get_mut(&capsule.question_hash) {
                    ids.retain(|i| i != id);
                }
            }
        }

        tracing::debug!(count = expired.len(), "expired capsules swept");
        Ok(expired.len())
    }
}

#[allow(clippy::too_many_arguments)]
fn row_to_capsule(
    id: &str,
    question_text: String,
    answer_text: String,
    hash_hex: &str,
    source_id: String,
    created_ms: i64,
    ttl: i64,
    sig_hex: &str,
) -> Result<KnowledgeCapsule, StoreError> {
    let capsule_id =
        Uuid::parse_str(id).map_err(|e| StoreError::Corrupt(format!("capsule_id: {e}")))?;
    let question_hash: [u8; 32] = hex::decode(hash_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::Corrupt("question_hash".into()))?;
    let signature: [u8; 64] = hex::decode(sig_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::Corrupt("signature".into()))?;
    let created_at: DateTime<Utc> = Utc
        .timestamp_millis_opt(created_ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt("created_at".into()))?;

    Ok(KnowledgeCapsule {
        capsule_id,
        question_text,
        answer_text,
        question_hash,
        source_id,
        created_at,
        ttl_seconds: ttl as u64,
        error_code: None,
        signature,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
