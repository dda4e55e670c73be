//! Configuration system for Cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml
//!
//! [`CairnConfig::validate`] enforces the contractual timeout relations;
//! a config that passes validation cannot produce a hub whose ack timeout
//! races its own link latency.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub identity: IdentityConfig,
    pub netsim: SimSettings,
    pub mini: MiniSettings,
    pub main: MainSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Canonical node name. Hashing it yields the wire-level node id.
    pub node_id: String,

    /// Path to the Ed25519 signing key. Auto-generated on first run.
    pub sign_key_path: PathBuf,

    /// Registered authorities: source_id → Ed25519 verifying key (hex).
    pub verify_keys_by_source: HashMap<String, String>,

    /// Pre-shared AEAD keys: peer node name → 256-bit key (hex).
    pub aead_keys_by_peer: HashMap<String, String>,
}

/// Simulator knobs. All runtime-mutable; each submitted frame observes a
/// point-in-time snapshot of this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    /// Fixed one-way latency applied to every chunk.
    pub base_latency_ms: u64,

    /// Uniform additive jitter in [0, latency_jitter_ms].
    pub latency_jitter_ms: u64,

    /// Per-chunk Bernoulli loss probability, in [0, 1].
    pub loss_probability: f64,

    /// Global delivery pacing; concurrent transmissions share this budget.
    pub bandwidth_bytes_per_sec: u64,

    /// Fragmentation threshold for encoded packets.
    pub max_chunk_size_bytes: usize,

    /// If false, oversized packets are rejected synchronously.
    pub auto_chunk_large_payloads: bool,

    /// When set, each chunk gets an extra uniform delay in
    /// [0, reorder_window_ms] so delivery order may differ from send order.
    pub enable_reordering: bool,

    pub reorder_window_ms: u64,

    /// Incomplete reassembly buffers are discarded after this long.
    /// Must be ≥ 2 × (base_latency_ms + reorder_window_ms).
    pub reassembly_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiniSettings {
    /// Canonical node name of the authoritative main hub.
    pub main_hub: String,

    /// Per-call wait for a capsule reply before returning Queued.
    pub reply_timeout_ms: u64,

    /// Missing-ACK window before a retransmission is scheduled.
    /// Must be ≥ 2 × (base_latency + jitter + reorder_window).
    pub ack_timeout_ms: u64,

    /// First retransmission delay; later attempts multiply.
    pub base_backoff_ms: u64,

    pub backoff_multiplier: f64,

    /// Attempt cap; past it the queue entry fails terminally.
    pub max_retries: u32,

    /// Similarity acceptance threshold for widened cache lookups.
    pub similarity_threshold: f64,

    /// Manifest poll interval.
    pub gossip_interval_ms: u64,

    /// Outstanding CAPSULE_REQUESTs allowed per peer.
    pub max_inflight_sync: usize,

    /// Expired-capsule sweep interval.
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MainSettings {
    /// Idempotent-response window for repeated packet ids.
    pub dedup_window_secs: u64,

    /// Manifest push interval. Must be < capsule_ttl_secs / 10.
    pub manifest_interval_ms: u64,

    /// TTL stamped on freshly generated capsules.
    pub capsule_ttl_secs: u64,

    /// Expired-capsule sweep interval.
    pub sweep_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CairnConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            netsim: SimSettings::default(),
            mini: MiniSettings::default(),
            main: MainSettings::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_id: "cairn-node".to_string(),
            sign_key_path: config_dir().join("sign_key"),
            verify_keys_by_source: HashMap::new(),
            aead_keys_by_peer: HashMap::new(),
        }
    }
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            base_latency_ms: 250,
            latency_jitter_ms: 100,
            loss_probability: 0.0,
            bandwidth_bytes_per_sec: 16 * 1024,
            max_chunk_size_bytes: 1024,
            auto_chunk_large_payloads: true,
            enable_reordering: false,
            reorder_window_ms: 500,
            reassembly_timeout_ms: 2000,
        }
    }
}

impl Default for MiniSettings {
    fn default() -> Self {
        Self {
            main_hub: "main".to_string(),
            reply_timeout_ms: 30_000,
            ack_timeout_ms: 2_000,
            base_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_retries: 6,
            similarity_threshold: 0.78,
            gossip_interval_ms: 45_000,
            max_inflight_sync: 8,
            sweep_interval_ms: 60_000,
        }
    }
}

impl Default for MainSettings {
    fn default() -> Self {
        Self {
            dedup_window_secs: 600,
            manifest_interval_ms: 30_000,
            capsule_ttl_secs: 3600,
            sweep_interval_ms: 60_000,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cairn")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("cairn")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading & validation ──────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars → file → defaults. Validates before returning.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Enforce the contractual relations between knobs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sim = &self.netsim;
        if !(0.0..=1.0).contains(&sim.loss_probability) {
            return Err(ConfigError::Invalid(format!(
                "loss_probability {} outside [0, 1]",
                sim.loss_probability
            )));
        }
        if sim.bandwidth_bytes_per_sec == 0 {
            return Err(ConfigError::Invalid(
                "bandwidth_bytes_per_sec must be > 0".into(),
            ));
        }
        if sim.max_chunk_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_chunk_size_bytes must be > 0".into(),
            ));
        }
        let reassembly_floor = 2 * (sim.base_latency_ms + sim.reorder_window_ms);
        if sim.reassembly_timeout_ms < reassembly_floor {
            return Err(ConfigError::Invalid(format!(
                "reassembly_timeout_ms {} below floor {} (2 × (base_latency + reorder_window))",
                sim.reassembly_timeout_ms, reassembly_floor
            )));
        }
        let ack_floor = 2 * (sim.base_latency_ms + sim.latency_jitter_ms + sim.reorder_window_ms);
        if self.mini.ack_timeout_ms < ack_floor {
            return Err(ConfigError::Invalid(format!(
                "ack_timeout_ms {} below floor {} (2 × (base_latency + jitter + reorder_window))",
                self.mini.ack_timeout_ms, ack_floor
            )));
        }
        if self.mini.reply_timeout_ms < self.mini.ack_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "reply_timeout_ms {} below ack_timeout_ms {}",
                self.mini.reply_timeout_ms, self.mini.ack_timeout_ms
            )));
        }
        if self.mini.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be > 0".into()));
        }
        if self.mini.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff_multiplier {} must be ≥ 1",
                self.mini.backoff_multiplier
            )));
        }
        let manifest_ceiling_ms = self.main.capsule_ttl_secs * 1000 / 10;
        if self.main.capsule_ttl_secs > 0 && self.main.manifest_interval_ms >= manifest_ceiling_ms {
            return Err(ConfigError::Invalid(format!(
                "manifest_interval_ms {} must be < capsule_ttl / 10 ({} ms)",
                self.main.manifest_interval_ms, manifest_ceiling_ms
            )));
        }
        Ok(())
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_IDENTITY__NODE_ID") {
            self.identity.node_id = v;
        }
        if let Ok(v) = std::env::var("CAIRN_MINI__MAIN_HUB") {
            self.mini.main_hub = v;
        }
        if let Ok(v) = std::env::var("CAIRN_NETSIM__LOSS_PROBABILITY") {
            if let Ok(p) = v.parse() {
                self.netsim.loss_probability = p;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_NETSIM__BASE_LATENCY_MS") {
            if let Ok(ms) = v.parse() {
                self.netsim.base_latency_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_NETSIM__BANDWIDTH_BYTES_PER_SEC") {
            if let Ok(b) = v.parse() {
                self.netsim.bandwidth_bytes_per_sec = b;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_MINI__MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.mini.max_retries = n;
            }
        }
    }
}
