//! cairnd — capsule-mesh daemon.
//!
//! Boots one main hub and the configured mini hubs onto a shared link
//! simulator, restores any persisted queue state, and runs until ctrl-c.
//! `RUST_LOG` controls verbosity, e.g. `RUST_LOG=debug cairnd`.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use cairn_core::config::{data_dir, CairnConfig};
use cairn_core::crypto::{AeadKey, SigningIdentity};
use cairn_netsim::NetSim;
use cairn_services::{AuthorityRegistry, CapsuleStore, RetryPolicy, TokenOverlap};
use cairnd::{EchoAnswers, MainHub, MiniHub, PresharedKeychain};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = CairnConfig::load().context("failed to load configuration")?;
    let data_dir = data_dir();
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let main_name = config.identity.node_id.clone();
    let signer = load_or_generate_signer(&config.identity.sign_key_path)?;

    // The main hub's keychain holds one pair key per mini. With no peers
    // configured, wire a single demo mini so the mesh has something to do.
    let main_keychain = PresharedKeychain::from_config(&config.identity.aead_keys_by_peer);
    let mut mini_names: Vec<String> = config.identity.aead_keys_by_peer.keys().cloned().collect();
    if mini_names.is_empty() {
        let demo = "mini-1".to_string();
        main_keychain.register(&demo, AeadKey::generate());
        mini_names.push(demo);
        tracing::info!("no peers configured, wiring demo mini hub");
    }
    mini_names.sort();

    let authority = AuthorityRegistry::with_persistence(data_dir.join("authorities.json"));
    authority.apply_config(&config.identity.verify_keys_by_source);
    authority.register(&main_name, signer.verifying_key());

    let sim = NetSim::new(config.netsim.clone());

    let main_store = CapsuleStore::open(data_dir.join("main-capsules.db"), authority.clone())
        .context("failed to open main capsule store")?;
    let main_hub = MainHub::start(
        &main_name,
        config.main.clone(),
        RetryPolicy::from_settings(&config.mini),
        main_store,
        signer,
        Arc::new(EchoAnswers),
        main_keychain.clone(),
        sim.clone(),
    );

    let mut minis = Vec::new();
    for name in &mini_names {
        let pair_key = main_keychain
            .key_for_name(name)
            .with_context(|| format!("no pair key for mini hub {name}"))?;
        let mini_keychain = PresharedKeychain::new();
        mini_keychain.register(&main_name, pair_key);

        let mut settings = config.mini.clone();
        settings.main_hub = main_name.clone();

        let store = CapsuleStore::open(
            data_dir.join(format!("{name}-capsules.db")),
            authority.clone(),
        )
        .with_context(|| format!("failed to open capsule store for {name}"))?;

        let mini = MiniHub::start(
            name,
            settings,
            store,
            authority.clone(),
            Arc::new(mini_keychain),
            sim.clone(),
            Some(Arc::new(TokenOverlap)),
        );

        let queue_path = data_dir.join(format!("{name}-queue.db"));
        let restored = mini
            .restore_queue(&queue_path)
            .with_context(|| format!("failed to restore queue for {name}"))?;
        if restored > 0 {
            tracing::info!(node = %name, restored, "resumed persisted queue entries");
        }

        minis.push((name.clone(), mini));
    }

    // Periodic status line so the mesh is observable from the log alone.
    {
        let sim = sim.clone();
        let main_hub = main_hub.clone();
        let minis: Vec<_> = minis.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await;
            loop {
                interval.tick().await;
                sim.log_stats();
                tracing::info!(manifest_entries = main_hub.latest_manifest().entries.len(), "main hub status");
                for (name, mini) in &minis {
                    tracing::info!(node = %name, capsules = mini.list_capsules().len(), "mini hub status");
                }
            }
        });
    }

    tracing::info!(
        main = %main_name,
        minis = mini_names.len(),
        "cairnd running, ctrl-c to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;

    tracing::info!("shutting down");
    for (name, mini) in &minis {
        let queue_path = data_dir.join(format!("{name}-queue.db"));
        match mini.persist_queue(&queue_path) {
            Ok(saved) => tracing::info!(node = %name, saved, "queue persisted"),
            Err(e) => tracing::error!(node = %name, error = %e, "queue persistence failed"),
        }
        mini.shutdown();
    }
    main_hub.shutdown();
    sim.shutdown();

    Ok(())
}

/// Load the Ed25519 signing key, generating and persisting one on first run.
fn load_or_generate_signer(path: &Path) -> Result<SigningIdentity> {
    if path.exists() {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read signing key {}", path.display()))?;
        let bytes: [u8; 32] = hex::decode(text.trim())
            .ok()
            .and_then(|b| b.try_into().ok())
            .with_context(|| format!("malformed signing key in {}", path.display()))?;
        Ok(SigningIdentity::from_bytes(bytes))
    } else {
        let signer = SigningIdentity::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, hex::encode(*signer.secret_bytes()))
            .with_context(|| format!("failed to write signing key {}", path.display()))?;
        tracing::info!(path = %path.display(), "generated new signing key");
        Ok(signer)
    }
}
