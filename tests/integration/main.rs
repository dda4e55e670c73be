//! Cairn integration harness.
//!
//! Every test drives a whole mesh in one process: a main hub, one or more
//! mini hubs, and a seeded link simulator between them. Timings are scaled
//! down (milliseconds where production uses seconds) so a lossy-link
//! scenario completes in a few seconds of wall clock; the seeded simulator
//! makes the loss draws reproducible.

mod queries;
mod recovery;
mod sync;
mod tampering;

use std::sync::Arc;
use std::time::Duration;

use cairn_core::capsule::KnowledgeCapsule;
use cairn_core::config::{MainSettings, MiniSettings, SimSettings};
use cairn_core::crypto::{AeadKey, SigningIdentity};
use cairn_core::wire::{node_id, NodeId};
use cairn_netsim::NetSim;
use cairn_services::{AuthorityRegistry, CapsuleStore, RetryPolicy};
use cairnd::{AnswerProvider, MainHub, MiniHub, PresharedKeychain, StaticAnswers};

pub const MAIN: &str = "main";

// ── Scaled-down settings ──────────────────────────────────────────────────────

pub fn fast_sim() -> SimSettings {
    SimSettings {
        base_latency_ms: 5,
        latency_jitter_ms: 0,
        loss_probability: 0.0,
        bandwidth_bytes_per_sec: u64::MAX / 4,
        max_chunk_size_bytes: 512,
        auto_chunk_large_payloads: true,
        enable_reordering: false,
        reorder_window_ms: 0,
        reassembly_timeout_ms: 200,
    }
}

pub fn fast_mini() -> MiniSettings {
    MiniSettings {
        main_hub: MAIN.to_string(),
        reply_timeout_ms: 8_000,
        ack_timeout_ms: 100,
        base_backoff_ms: 50,
        backoff_multiplier: 2.0,
        max_retries: 6,
        similarity_threshold: 0.78,
        // Long by default so gossip does not interfere with query tests;
        // the sync scenarios shorten it.
        gossip_interval_ms: 60_000,
        max_inflight_sync: 8,
        sweep_interval_ms: 60_000,
    }
}

pub fn fast_main() -> MainSettings {
    MainSettings {
        dedup_window_secs: 600,
        manifest_interval_ms: 60_000,
        capsule_ttl_secs: 3600,
        sweep_interval_ms: 60_000,
    }
}

pub struct MeshOptions {
    pub n_minis: usize,
    pub seed: u64,
    pub sim: SimSettings,
    pub mini: MiniSettings,
    pub main: MainSettings,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            n_minis: 1,
            seed: 7,
            sim: fast_sim(),
            mini: fast_mini(),
            main: fast_main(),
        }
    }
}

// ── Mesh ──────────────────────────────────────────────────────────────────────

pub struct TestMesh {
    pub sim: NetSim,
    pub main: MainHub,
    pub main_store: CapsuleStore,
    pub minis: Vec<MiniHub>,
    /// Store handle behind `minis[i]`, for seeding and inspection.
    pub mini_stores: Vec<CapsuleStore>,
    pub mini_names: Vec<String>,
    /// Pair key shared between the main hub and `minis[i]`.
    pub pair_keys: Vec<AeadKey>,
    pub authority: AuthorityRegistry,
    signer: SigningIdentity,
}

impl TestMesh {
    pub fn mini(&self, index: usize) -> &MiniHub {
        &self.minis[index]
    }

    pub fn main_id(&self) -> NodeId {
        node_id(MAIN)
    }

    pub fn mini_id(&self, index: usize) -> NodeId {
        node_id(&self.mini_names[index])
    }

    /// Sign and store a capsule directly on the main hub, as if generated
    /// for an earlier query.
    pub fn seed_main(&self, question: &str, answer: &str) -> KnowledgeCapsule {
        let capsule =
            KnowledgeCapsule::create(question, answer.to_string(), MAIN, 3600, &self.signer);
        self.main_store.put(&capsule).expect("seeding main store");
        capsule
    }

    /// Store an already-built capsule on a mini hub, as if previously
    /// synced. Signature verification still applies.
    pub fn seed_mini(&self, index: usize, capsule: &KnowledgeCapsule) {
        self.mini_stores[index]
            .put(capsule)
            .expect("seeding mini store");
    }

    pub fn signer(&self) -> &SigningIdentity {
        &self.signer
    }

    pub fn shutdown(&self) {
        for mini in &self.minis {
            mini.shutdown();
        }
        self.main.shutdown();
        self.sim.shutdown();
    }
}

pub fn start_mesh(options: MeshOptions, answers: Arc<dyn AnswerProvider>) -> TestMesh {
    let sim = NetSim::with_seed(options.sim, options.seed);

    let signer = SigningIdentity::generate();
    let harness_signer = SigningIdentity::from_bytes(*signer.secret_bytes());

    let authority = AuthorityRegistry::new();
    authority.register(MAIN, signer.verifying_key());

    let main_keychain = Arc::new(PresharedKeychain::new());
    let mut mini_names = Vec::new();
    let mut pair_keys = Vec::new();
    for i in 0..options.n_minis {
        let name = format!("mini-{}", i + 1);
        let key = AeadKey::generate();
        main_keychain.register(&name, key.clone());
        mini_names.push(name);
        pair_keys.push(key);
    }

    let main_store = CapsuleStore::in_memory(authority.clone()).unwrap();
    let main = MainHub::start(
        MAIN,
        options.main,
        RetryPolicy::from_settings(&options.mini),
        main_store.clone(),
        signer,
        answers,
        main_keychain,
        sim.clone(),
    );

    let mut minis = Vec::new();
    let mut mini_stores = Vec::new();
    for (name, key) in mini_names.iter().zip(&pair_keys) {
        let keychain = PresharedKeychain::new();
        keychain.register(MAIN, key.clone());
        let store = CapsuleStore::in_memory(authority.clone()).unwrap();
        let mini = MiniHub::start(
            name,
            options.mini.clone(),
            store.clone(),
            authority.clone(),
            Arc::new(keychain),
            sim.clone(),
            None,
        );
        minis.push(mini);
        mini_stores.push(store);
    }

    TestMesh {
        sim,
        main,
        main_store,
        minis,
        mini_stores,
        mini_names,
        pair_keys,
        authority,
        signer: harness_signer,
    }
}

/// Canned answers used by most scenarios.
pub fn canned_answers() -> Arc<StaticAnswers> {
    Arc::new(
        StaticAnswers::new()
            .with(
                "How do quantum computers work?",
                "They exploit superposition and entanglement.",
            )
            .with("Define entropy", "A measure of disorder in a system.")
            .with("Explain TLS", "A protocol for authenticated encrypted channels.")
            .with_fallback("No better answer is known."),
    )
}

// ── Polling helper ────────────────────────────────────────────────────────────

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for(what: &str, timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
