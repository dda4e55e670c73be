//! Pre-shared keychain — the daemon's implementation of `AeadKeychain`.
//!
//! One 256-bit AES-GCM key per peer pair, loaded from config or registered
//! at wiring time. The lookup is by wire-level node id; the keychain also
//! remembers the canonical name behind each id for logs and routing.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use cairn_core::crypto::{AeadKey, AeadKeychain};
use cairn_core::wire::{node_id, NodeId};

#[derive(Default)]
pub struct PresharedKeychain {
    keys: DashMap<NodeId, AeadKey>,
    names: DashMap<NodeId, String>,
}

impl PresharedKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config: peer node name → key hex. Malformed entries are
    /// skipped with a warning rather than refusing to start.
    pub fn from_config(aead_keys_by_peer: &HashMap<String, String>) -> Arc<Self> {
        let keychain = Self::new();
        for (name, hex_key) in aead_keys_by_peer {
            match hex::decode(hex_key).ok().and_then(|b| <[u8; 32]>::try_from(b).ok()) {
                Some(bytes) => keychain.register(name, AeadKey::from_bytes(bytes)),
                None => {
                    tracing::warn!(peer = %name, "ignoring malformed AEAD key in config");
                }
            }
        }
        Arc::new(keychain)
    }

    /// Register the pair key shared with `name`.
    pub fn register(&self, name: &str, key: AeadKey) {
        let id = node_id(name);
        self.keys.insert(id, key);
        self.names.insert(id, name.to_string());
    }

    /// Canonical name behind a node id, if known.
    pub fn name_of(&self, id: &NodeId) -> Option<String> {
        self.names.get(id).map(|n| n.clone())
    }

    /// The pair key registered for a peer, by canonical name.
    pub fn key_for_name(&self, name: &str) -> Option<AeadKey> {
        self.keys.get(&node_id(name)).map(|k| k.clone())
    }

    /// All known peers.
    pub fn peers(&self) -> Vec<(NodeId, String)> {
        self.names
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}

impl AeadKeychain for PresharedKeychain {
    fn key_for(&self, peer: &NodeId) -> Option<AeadKey> {
        self.keys.get(peer).map(|k| k.clone())
    }
}
