//! Authority registry — which main hubs this node believes.
//!
//! Maps a `source_id` to its registered Ed25519 verifying key. A capsule or
//! manifest is only accepted when its signature verifies against the key
//! registered for its source; unknown signers are rejected outright.
//!
//! When constructed with a `persist_path`, registrations are written to disk
//! on every mutation and reloaded on startup, so runtime trust changes
//! survive a restart.

use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Registry of trusted capsule sources.
pub struct AuthorityRegistry {
    keys: Arc<DashMap<String, [u8; 32]>>,
    persist_path: Arc<Option<PathBuf>>,
}

impl Default for AuthorityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthorityRegistry {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(DashMap::new()),
            persist_path: Arc::new(None),
        }
    }

    /// Create a registry that persists registrations to the given file.
    /// Loads existing registrations from disk if the file exists.
    pub fn with_persistence(path: PathBuf) -> Self {
        let registry = Self {
            keys: Arc::new(DashMap::new()),
            persist_path: Arc::new(Some(path)),
        };
        registry.load_from_disk();
        registry
    }

    /// Apply config-sourced registrations: source_id → verifying key (hex).
    pub fn apply_config(&self, verify_keys: &HashMap<String, String>) {
        for (source_id, hex_key) in verify_keys {
            if let Ok(bytes) = hex::decode(hex_key) {
                if bytes.len() == 32 {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&bytes);
                    self.keys.insert(source_id.clone(), key);
                    tracing::info!(source_id, "registered authority from config");
                    continue;
                }
            }
            tracing::warn!(source_id, "ignoring malformed verifying key in config");
        }
    }

    /// Register a source's verifying key.
    pub fn register(&self, source_id: &str, verifying_key: [u8; 32]) {
        self.keys.insert(source_id.to_string(), verifying_key);
        self.save_to_disk();
        tracing::info!(source_id, "authority registered");
    }

    /// Remove a source. Capsules it signed will no longer be accepted.
    pub fn remove(&self, source_id: &str) {
        self.keys.remove(source_id);
        self.save_to_disk();
        tracing::info!(source_id, "authority removed");
    }

    /// The verifying key registered for a source, if any.
    pub fn verifying_key(&self, source_id: &str) -> Option<[u8; 32]> {
        self.keys.get(source_id).map(|k| *k.value())
    }

    pub fn is_registered(&self, source_id: &str) -> bool {
        self.keys.contains_key(source_id)
    }

    /// All registered sources.
    pub fn list(&self) -> Vec<(String, [u8; 32])> {
        self.keys
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

impl AuthorityRegistry {
    /// Serialize registrations to disk as JSON. Best-effort — logs on failure.
    fn save_to_disk(&self) {
        let path = match self.persist_path.as_ref() {
            Some(p) => p,
            None => return,
        };
        let snapshot: HashMap<String, String> = self
            .keys
            .iter()
            .map(|entry| (entry.key().clone(), hex::encode(entry.value())))
            .collect();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, path = %path.display(), "failed to persist authorities");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize authorities");
            }
        }
    }

    /// Load registrations from disk. Called once during construction.
    fn load_from_disk(&self) {
        let path = match self.persist_path.as_ref() {
            Some(p) => p,
            None => return,
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read authorities");
                return;
            }
        };
        let map: HashMap<String, String> = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse authorities");
                return;
            }
        };
        let mut loaded = 0usize;
        for (source_id, hex_key) in &map {
            if let Ok(bytes) = hex::decode(hex_key) {
                if bytes.len() == 32 {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&bytes);
                    self.keys.insert(source_id.clone(), key);
                    loaded += 1;
                }
            }
        }
        if loaded > 0 {
            tracing::info!(count = loaded, path = %path.display(), "loaded persisted authorities");
        }
    }
}

impl Clone for AuthorityRegistry {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            persist_path: self.persist_path.clone(),
        }
    }
}
