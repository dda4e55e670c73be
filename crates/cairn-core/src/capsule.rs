//! Knowledge capsules — immutable, signed Q/A records with a TTL.
//!
//! A capsule binds a question to an answer under the producing main hub's
//! Ed25519 key. The signature covers the canonical serialization, so any
//! store can re-verify a capsule it did not produce. Capsules never change
//! after creation; a new answer is a new capsule.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{self, CryptoError, SigningIdentity};

// ── Serde helpers ─────────────────────────────────────────────────────────────

/// Hex encoding for fixed-size byte arrays in JSON payloads.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(deserializer)?;
        let decoded = hex::decode(&text).map_err(serde::de::Error::custom)?;
        decoded
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {N} bytes")))
    }
}

/// JSON string literal with correct escaping, for canonical serialization.
pub(crate) fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// RFC3339 with millisecond precision and `Z` suffix — the only timestamp
/// rendering that appears in canonical bytes.
pub(crate) fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// UTC now, truncated to millisecond precision so canonical timestamps
/// round-trip exactly.
pub fn now_millis() -> DateTime<Utc> {
    let millis = Utc::now().timestamp_millis();
    match Utc.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(ts) => ts,
        _ => Utc::now(),
    }
}

// ── Capsule ───────────────────────────────────────────────────────────────────

/// An immutable, signed Q/A record produced by a main hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeCapsule {
    /// Globally unique capsule identity (UUID v4).
    pub capsule_id: Uuid,

    /// The question as originally asked.
    pub question_text: String,

    /// The answer text. Empty for error capsules.
    pub answer_text: String,

    /// SHA-256 of the normalized question — the cache key.
    #[serde(with = "hex_bytes")]
    pub question_hash: [u8; 32],

    /// Identifier of the producing main hub.
    pub source_id: String,

    /// Creation time, UTC, millisecond precision.
    pub created_at: DateTime<Utc>,

    /// Freshness window: the capsule is fresh iff
    /// `now − created_at < ttl_seconds`. Zero means immediately expired.
    pub ttl_seconds: u64,

    /// Machine-readable failure code, present only on error capsules.
    /// Error capsules are delivered but never cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Ed25519 signature over [`canonical_bytes`](Self::canonical_bytes),
    /// produced by `source_id`'s key.
    #[serde(with = "hex_bytes")]
    pub signature: [u8; 64],
}

impl KnowledgeCapsule {
    /// Bind an answer into a signed capsule.
    pub fn create(
        question: &str,
        answer: String,
        source_id: &str,
        ttl_seconds: u64,
        signer: &SigningIdentity,
    ) -> Self {
        let mut capsule = Self {
            capsule_id: Uuid::new_v4(),
            question_text: question.to_string(),
            answer_text: answer,
            question_hash: crypto::question_hash(question),
            source_id: source_id.to_string(),
            created_at: now_millis(),
            ttl_seconds,
            error_code: None,
            signature: [0u8; 64],
        };
        capsule.signature = signer.sign(&capsule.canonical_bytes());
        capsule
    }

    /// Bind an answer failure into a signed error capsule.
    ///
    /// Error capsules carry an empty answer and a machine-readable code.
    /// Receivers surface them to the caller and do not store them.
    pub fn create_error(
        question: &str,
        error_code: &str,
        source_id: &str,
        signer: &SigningIdentity,
    ) -> Self {
        let mut capsule = Self::create(question, String::new(), source_id, 0, signer);
        capsule.error_code = Some(error_code.to_string());
        capsule
    }

    /// Canonical serialization for signing: fixed key order, UTF-8, no
    /// whitespace, integers as integers, timestamps as RFC3339 with
    /// millisecond precision and `Z` suffix.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "{{\"capsule_id\":{},\"question_text\":{},\"answer_text\":{},\
             \"question_hash\":{},\"source_id\":{},\"created_at\":{},\
             \"ttl_seconds\":{}}}",
            json_string(&self.capsule_id.to_string()),
            json_string(&self.question_text),
            json_string(&self.answer_text),
            json_string(&hex::encode(self.question_hash)),
            json_string(&self.source_id),
            json_string(&canonical_timestamp(&self.created_at)),
            self.ttl_seconds,
        )
        .into_bytes()
    }

    /// Verify the capsule's signature against the registered verifying key
    /// of its source.
    pub fn verify(&self, verifying_key: &[u8; 32]) -> Result<(), CryptoError> {
        crypto::verify_signature(verifying_key, &self.canonical_bytes(), &self.signature)
    }

    /// A capsule is fresh iff its TTL window has not elapsed.
    /// `ttl_seconds == 0` is never fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age_millis = now.timestamp_millis() - self.created_at.timestamp_millis();
        age_millis >= 0 && (age_millis as u128) < (self.ttl_seconds as u128) * 1000
    }

    /// True for error capsules — delivered but never cached.
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    /// Serialize to bytes for transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from received bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
