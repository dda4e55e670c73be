//! Cryptographic primitives for Cairn.
//!
//! Provides three things:
//!   1. Hashing — BLAKE3 node ids, SHA-256 question hashes
//!   2. AES-256-GCM packet sealing under pre-shared per-peer keys
//!   3. Ed25519 capsule and manifest signatures
//!
//! Key establishment is modeled as a pre-shared 256-bit symmetric key per
//! sender–receiver pair, resolved through the [`AeadKeychain`] trait so a
//! future ephemeral key agreement can replace it without touching the codec
//! or hub logic.
//!
//! All private key material derives ZeroizeOnDrop — wiped from memory when
//! dropped. There is no unsafe code in this module.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use ed25519_dalek::{Signer, Verifier};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::wire::{NodeId, NONCE_LEN};

// ── Hashing ───────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for node id derivation and content fingerprints. Question hashes
/// use SHA-256 — see [`question_hash`].
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Canonicalize a question for hashing and cache lookup.
///
/// Lowercases, NFC-normalizes, and collapses runs of whitespace to single
/// spaces. Two questions that normalize identically are the same question.
pub fn normalize_question(question: &str) -> String {
    question
        .to_lowercase()
        .nfc()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 digest of the normalized question.
///
/// This is the authoritative cache key: a capsule answers a question iff
/// their question hashes match.
pub fn question_hash(question: &str) -> [u8; 32] {
    let normalized = normalize_question(question);
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

// ── AEAD ──────────────────────────────────────────────────────────────────────

/// A pre-shared 256-bit AES-GCM key for one sender–receiver pair.
///
/// The raw bytes are zeroized on drop and never exposed directly.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey(Zeroizing<[u8; 32]>);

impl AeadKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Generate a fresh random key. Test and provisioning use only.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(Zeroizing::new(bytes))
    }

    /// Encrypt `plaintext` under a fresh random 96-bit nonce.
    ///
    /// Returns the nonce and the ciphertext with the 16-byte auth tag
    /// appended — both are carried in the packet frame.
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*self.0));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptFail)?;
        Ok((nonce, ciphertext))
    }

    /// Decrypt ciphertext (with trailing auth tag) under the carried nonce.
    ///
    /// Any tampering with nonce, ciphertext, or tag fails the tag check.
    pub fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFail)
    }
}

/// Pluggable per-peer AEAD key lookup.
///
/// The packet codec and both hub engines resolve keys through this trait
/// only; swapping the pre-shared table for a real key agreement is a
/// one-struct change.
pub trait AeadKeychain: Send + Sync {
    /// The key shared with `peer`, or None if the peer is unknown.
    fn key_for(&self, peer: &NodeId) -> Option<AeadKey>;
}

// ── Ed25519 ───────────────────────────────────────────────────────────────────

/// A node's long-term Ed25519 signing identity.
///
/// Generated once per node and stored persistently. The verifying key is
/// registered with peers under the node's source id; the signing key never
/// leaves this struct.
pub struct SigningIdentity {
    key: ed25519_dalek::SigningKey,
}

impl SigningIdentity {
    /// Generate a new random Ed25519 keypair.
    pub fn generate() -> Self {
        Self {
            key: ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Reconstruct an identity from stored secret key bytes.
    /// The verifying key is derived deterministically from the secret.
    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(&secret),
        }
    }

    /// Serialize the secret key for persistent storage.
    /// Store these bytes securely (mode 0600, ideally encrypted at rest).
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.key.to_bytes())
    }

    /// The 32-byte verifying key peers register for this node.
    pub fn verifying_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    /// Sign a message, returning the 64-byte detached signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

/// Verify a detached Ed25519 signature against a registered verifying key.
pub fn verify_signature(
    verifying_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), CryptoError> {
    let key = ed25519_dalek::VerifyingKey::from_bytes(verifying_key)
        .map_err(|_| CryptoError::BadVerifyingKey)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    key.verify(message, &sig)
        .map_err(|_| CryptoError::SigInvalid)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    EncryptFail,

    #[error("AEAD decryption failed: bad key, nonce, or tampered ciphertext")]
    DecryptFail,

    #[error("malformed Ed25519 verifying key")]
    BadVerifyingKey,

    #[error("Ed25519 signature verification failed")]
    SigInvalid,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
