//! Manifest gossip and selective-sync scenarios.

use std::collections::HashSet;
use std::time::Duration;

use uuid::Uuid;

use crate::{canned_answers, start_mesh, wait_for, MeshOptions};

#[tokio::test]
async fn s5_fresh_mini_converges_via_manifest_push() {
    let mut options = MeshOptions {
        seed: 55,
        ..MeshOptions::default()
    };
    options.main.manifest_interval_ms = 250;
    let mesh = start_mesh(options, canned_answers());

    let seeded: HashSet<Uuid> = (0..10)
        .map(|i| {
            mesh.seed_main(&format!("Seed question {i}?"), &format!("Seed answer {i}."))
                .capsule_id
        })
        .collect();

    // Two-ish gossip intervals at zero loss are enough: ten capsules at
    // eight inflight requests take two waves.
    wait_for("mini holds all seeded capsules", Duration::from_secs(5), || {
        mesh.mini_stores[0].len() == 10
    })
    .await;

    let held: HashSet<Uuid> = mesh
        .mini(0)
        .list_capsules()
        .iter()
        .map(|c| c.capsule_id)
        .collect();
    assert_eq!(held, seeded, "mini must hold exactly the seeded set");
    mesh.shutdown();
}

#[tokio::test]
async fn poll_driven_sync_converges_without_pushes() {
    let mut options = MeshOptions {
        seed: 56,
        ..MeshOptions::default()
    };
    // Pushes effectively off; the mini's poll drives convergence.
    options.main.manifest_interval_ms = 600_000;
    options.mini.gossip_interval_ms = 250;
    let mesh = start_mesh(options, canned_answers());

    for i in 0..3 {
        mesh.seed_main(&format!("Polled question {i}?"), "Polled answer.");
    }

    wait_for("mini converges by polling", Duration::from_secs(5), || {
        mesh.mini_stores[0].len() == 3
    })
    .await;
    mesh.shutdown();
}

#[tokio::test]
async fn sync_survives_loss() {
    let mut options = MeshOptions {
        seed: 57,
        ..MeshOptions::default()
    };
    options.sim.loss_probability = 0.25;
    options.main.manifest_interval_ms = 250;
    options.mini.gossip_interval_ms = 250;
    let mesh = start_mesh(options, canned_answers());

    for i in 0..5 {
        mesh.seed_main(&format!("Lossy sync question {i}?"), "Still arrives.");
    }

    // Double-driven gossip (push + poll) converges despite chunk loss.
    wait_for("mini converges despite loss", Duration::from_secs(15), || {
        mesh.mini_stores[0].len() == 5
    })
    .await;
    mesh.shutdown();
}

#[tokio::test]
async fn capsules_generated_later_are_gossiped() {
    let mut options = MeshOptions {
        n_minis: 2,
        seed: 58,
        ..MeshOptions::default()
    };
    options.main.manifest_interval_ms = 250;
    let mesh = start_mesh(options, canned_answers());

    // mini-1 asks; mini-2 learns the capsule purely through gossip.
    let result = mesh
        .mini(0)
        .query("u1", "How do quantum computers work?", None)
        .await
        .unwrap();
    assert!(matches!(result, cairnd::QueryResult::Fresh(_)));

    wait_for("second mini learns via gossip", Duration::from_secs(5), || {
        mesh.mini_stores[1].len() == 1
    })
    .await;

    let synced = &mesh.mini(1).list_capsules()[0];
    assert_eq!(synced.source_id, "main");
    synced.verify(&mesh.signer().verifying_key()).unwrap();
    mesh.shutdown();
}
