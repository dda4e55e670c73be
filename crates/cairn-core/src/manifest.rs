//! Signed capsule manifests — the unit of gossip.
//!
//! A manifest lists every fresh capsule a main hub currently holds, ordered
//! by creation time. Mini hubs diff a verified manifest against their local
//! store and fetch only what they are missing (selective sync).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capsule::{canonical_timestamp, hex_bytes, json_string, now_millis};
use crate::crypto::{self, CryptoError, SigningIdentity};

/// One capsule the manifest source holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub capsule_id: Uuid,

    #[serde(with = "hex_bytes")]
    pub question_hash: [u8; 32],

    pub created_at: DateTime<Utc>,
}

/// A signed listing of every fresh capsule a source holds.
///
/// Entries are ordered by `created_at` ascending; the signature covers the
/// canonical serialization of all fields except itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub source_id: String,

    pub generated_at: DateTime<Utc>,

    pub entries: Vec<ManifestEntry>,

    #[serde(with = "hex_bytes")]
    pub signature: [u8; 64],
}

impl Manifest {
    /// Build and sign a manifest over the given entries.
    ///
    /// The caller supplies entries already ordered by `created_at`
    /// ascending; ordering is re-established here so the canonical bytes
    /// are deterministic regardless of the source iteration order.
    pub fn build(
        source_id: &str,
        mut entries: Vec<ManifestEntry>,
        signer: &SigningIdentity,
    ) -> Self {
        entries.sort_by_key(|e| (e.created_at, e.capsule_id));
        let mut manifest = Self {
            source_id: source_id.to_string(),
            generated_at: now_millis(),
            entries,
            signature: [0u8; 64],
        };
        manifest.signature = signer.sign(&manifest.canonical_bytes());
        manifest
    }

    /// Canonical serialization for signing: fixed key order, no whitespace,
    /// timestamps as RFC3339 milliseconds with `Z` suffix.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str("{\"source_id\":");
        out.push_str(&json_string(&self.source_id));
        out.push_str(",\"generated_at\":");
        out.push_str(&json_string(&canonical_timestamp(&self.generated_at)));
        out.push_str(",\"entries\":[");
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str("{\"capsule_id\":");
            out.push_str(&json_string(&entry.capsule_id.to_string()));
            out.push_str(",\"question_hash\":");
            out.push_str(&json_string(&hex::encode(entry.question_hash)));
            out.push_str(",\"created_at\":");
            out.push_str(&json_string(&canonical_timestamp(&entry.created_at)));
            out.push('}');
        }
        out.push_str("]}");
        out.into_bytes()
    }

    /// Verify the manifest signature against the source's registered key.
    pub fn verify(&self, verifying_key: &[u8; 32]) -> Result<(), CryptoError> {
        crypto::verify_signature(verifying_key, &self.canonical_bytes(), &self.signature)
    }

    /// Capsule ids listed in this manifest.
    pub fn capsule_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.entries.iter().map(|e| e.capsule_id)
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(offset_secs: i64) -> ManifestEntry {
        ManifestEntry {
            capsule_id: Uuid::new_v4(),
            question_hash: [0x42; 32],
            created_at: now_millis() - Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn build_orders_entries_by_created_at() {
        let signer = SigningIdentity::generate();
        let manifest = Manifest::build("main", vec![entry(1), entry(30), entry(10)], &signer);

        let times: Vec<_> = manifest.entries.iter().map(|e| e.created_at).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }

    #[test]
    fn signature_verifies_and_covers_entries() {
        let signer = SigningIdentity::generate();
        let mut manifest = Manifest::build("main", vec![entry(5), entry(2)], &signer);
        manifest.verify(&signer.verifying_key()).unwrap();

        // Dropping an entry must break the signature
        manifest.entries.pop();
        assert_eq!(
            manifest.verify(&signer.verifying_key()),
            Err(CryptoError::SigInvalid)
        );
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let signer = SigningIdentity::generate();
        let other = SigningIdentity::generate();
        let manifest = Manifest::build("main", vec![entry(1)], &signer);
        assert_eq!(
            manifest.verify(&other.verifying_key()),
            Err(CryptoError::SigInvalid)
        );
    }

    #[test]
    fn empty_manifest_is_valid() {
        let signer = SigningIdentity::generate();
        let manifest = Manifest::build("main", Vec::new(), &signer);
        manifest.verify(&signer.verifying_key()).unwrap();
        assert_eq!(manifest.capsule_ids().count(), 0);
    }

    #[test]
    fn serde_roundtrip_preserves_signature() {
        let signer = SigningIdentity::generate();
        let manifest = Manifest::build("main", vec![entry(3), entry(7)], &signer);
        let bytes = manifest.to_bytes().unwrap();
        let decoded = Manifest::from_bytes(&bytes).unwrap();
        decoded.verify(&signer.verifying_key()).unwrap();
        assert_eq!(decoded.entries.len(), 2);
    }

    #[test]
    fn canonical_bytes_exclude_signature() {
        let signer = SigningIdentity::generate();
        let manifest = Manifest::build("main", vec![entry(1)], &signer);
        let canonical = String::from_utf8(manifest.canonical_bytes()).unwrap();
        assert!(!canonical.contains("signature"));
    }
}
