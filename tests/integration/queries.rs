//! Query-path scenarios: cache hits, authoritative round trips, error
//! capsules, and admission boundaries.

use std::sync::Arc;
use std::time::Duration;

use cairn_core::codec::{encode_packet, QueryBody};
use cairn_core::wire::PacketType;
use cairn_netsim::SubmitError;
use cairnd::{FailingAnswers, QueryResult};
use uuid::Uuid;

use crate::{canned_answers, start_mesh, wait_for, MeshOptions};

#[tokio::test]
async fn s1_cache_hit_stays_local() {
    let mesh = start_mesh(MeshOptions::default(), canned_answers());

    let capsule = mesh.seed_main("What is photosynthesis?", "Light to chemical energy.");
    mesh.seed_mini(0, &capsule);

    let result = mesh
        .mini(0)
        .query("u1", "What is photosynthesis?", None)
        .await
        .unwrap();

    match result {
        QueryResult::CacheHit(hit) => {
            assert_eq!(hit.source_id, "main");
            assert_eq!(hit.capsule_id, capsule.capsule_id);
        }
        other => panic!("expected CacheHit, got {other:?}"),
    }

    assert_eq!(
        mesh.sim.stats().chunks_sent,
        0,
        "a cache hit must not touch the link"
    );
    mesh.shutdown();
}

#[tokio::test]
async fn s2_authoritative_round_trip() {
    let mut options = MeshOptions {
        n_minis: 2,
        seed: 21,
        ..MeshOptions::default()
    };
    options.sim.loss_probability = 0.05;
    options.sim.bandwidth_bytes_per_sec = 1024;
    let mesh = start_mesh(options, canned_answers());

    let result = mesh
        .mini(1)
        .query("u2", "How do quantum computers work?", None)
        .await
        .unwrap();

    let capsule = match result {
        QueryResult::Fresh(c) => c,
        other => panic!("expected Fresh, got {other:?}"),
    };
    assert_eq!(
        capsule.answer_text,
        "They exploit superposition and entanglement."
    );
    assert_eq!(capsule.source_id, "main");

    // Both stores hold the same capsule, and the next manifest lists it.
    assert!(mesh.mini_stores[1].get(&capsule.capsule_id).is_some());
    assert!(mesh.main_store.get(&capsule.capsule_id).is_some());
    let manifest = mesh.main.latest_manifest();
    assert!(manifest.capsule_ids().any(|id| id == capsule.capsule_id));
    manifest.verify(&mesh.signer().verifying_key()).unwrap();

    mesh.shutdown();
}

#[tokio::test]
async fn lossless_query_is_fresh_quickly() {
    let mesh = start_mesh(MeshOptions::default(), canned_answers());

    let started = tokio::time::Instant::now();
    let result = mesh.mini(0).query("u3", "Define entropy", None).await.unwrap();
    match result {
        QueryResult::Fresh(capsule) => {
            assert_eq!(capsule.answer_text, "A measure of disorder in a system.")
        }
        other => panic!("expected Fresh, got {other:?}"),
    }
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "lossless round trip should take a couple of RTTs"
    );
    mesh.shutdown();
}

#[tokio::test]
async fn second_query_hits_the_cache() {
    let mesh = start_mesh(MeshOptions::default(), canned_answers());

    let first = mesh.mini(0).query("u1", "Define entropy", None).await.unwrap();
    assert!(matches!(first, QueryResult::Fresh(_)));

    let second = mesh.mini(0).query("u1", "define ENTROPY", None).await.unwrap();
    match second {
        QueryResult::CacheHit(capsule) => {
            assert_eq!(capsule.answer_text, "A measure of disorder in a system.")
        }
        other => panic!("expected CacheHit, got {other:?}"),
    }
    mesh.shutdown();
}

#[tokio::test]
async fn answer_failure_surfaces_and_is_not_cached() {
    let mesh = start_mesh(MeshOptions::default(), Arc::new(FailingAnswers));

    let result = mesh.mini(0).query("u4", "Explain TLS", None).await.unwrap();
    match result {
        QueryResult::Unavailable { code, .. } => assert_eq!(code, "answer_fail"),
        other => panic!("expected Unavailable, got {other:?}"),
    }

    assert!(
        mesh.mini_stores[0].is_empty(),
        "error capsules must never be cached"
    );
    mesh.shutdown();
}

#[tokio::test]
async fn duplicate_query_packet_is_idempotent() {
    let mesh = start_mesh(MeshOptions::default(), canned_answers());

    let body = serde_json::to_vec(&QueryBody {
        question: "Define entropy".into(),
        user_id: "u5".into(),
        reply_to: mesh.mini_names[0].clone(),
    })
    .unwrap();
    let packet_id = Uuid::new_v4();
    let encoded = encode_packet(
        PacketType::Query,
        packet_id,
        mesh.mini_id(0),
        mesh.main_id(),
        &body,
        &mesh.pair_keys[0],
    )
    .unwrap();

    // The same packet id twice: one capsule is generated, the second
    // delivery is answered from the dedup window.
    mesh.sim
        .submit(mesh.mini_id(0), mesh.main_id(), encoded.clone())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    mesh.sim
        .submit(mesh.mini_id(0), mesh.main_id(), encoded)
        .unwrap();

    wait_for("capsule cached at mini", Duration::from_secs(3), || {
        !mesh.mini_stores[0].is_empty()
    })
    .await;
    assert_eq!(mesh.main_store.len(), 1, "dedup must not mint a second capsule");
    assert_eq!(mesh.mini_stores[0].len(), 1);
    mesh.shutdown();
}

#[tokio::test]
async fn oversized_submission_rejected_synchronously() {
    let mut options = MeshOptions::default();
    options.sim.auto_chunk_large_payloads = false;
    options.sim.max_chunk_size_bytes = 256;
    let mesh = start_mesh(options, canned_answers());

    let encoded = encode_packet(
        PacketType::Query,
        Uuid::new_v4(),
        mesh.mini_id(0),
        mesh.main_id(),
        &vec![0u8; 4096],
        &mesh.pair_keys[0],
    )
    .unwrap();

    match mesh.sim.submit(mesh.mini_id(0), mesh.main_id(), encoded) {
        Err(SubmitError::Oversized { .. }) => {}
        other => panic!("expected Oversized, got {other:?}"),
    }
    mesh.shutdown();
}
