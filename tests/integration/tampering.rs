//! Trust-boundary scenarios: tampered capsules, unknown signers, and
//! corrupted ciphertext are dropped without ever entering a store.

use std::time::Duration;

use cairn_core::capsule::KnowledgeCapsule;
use cairn_core::codec::encode_packet;
use cairn_core::crypto::SigningIdentity;
use cairn_core::wire::PacketType;
use uuid::Uuid;

use crate::{canned_answers, start_mesh, MeshOptions};

/// Let in-flight deliveries land before asserting on the receiving side.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn s6_tampered_capsule_is_rejected() {
    let mesh = start_mesh(MeshOptions::default(), canned_answers());

    let mut capsule = KnowledgeCapsule::create(
        "What is photosynthesis?",
        "Light to chemical energy.".to_string(),
        "main",
        3600,
        mesh.signer(),
    );
    // Flip one byte of the answer after signing.
    let mut answer = capsule.answer_text.into_bytes();
    answer[0] ^= 0x01;
    capsule.answer_text = String::from_utf8(answer).unwrap();

    let encoded = encode_packet(
        PacketType::Capsule,
        Uuid::new_v4(),
        mesh.main_id(),
        mesh.mini_id(0),
        &capsule.to_bytes().unwrap(),
        &mesh.pair_keys[0],
    )
    .unwrap();
    mesh.sim
        .submit(mesh.main_id(), mesh.mini_id(0), encoded)
        .unwrap();
    settle().await;

    assert!(mesh.mini_stores[0].is_empty(), "tampered capsule must not be stored");
    assert_eq!(mesh.mini(0).metrics().sig_invalid, 1);
    mesh.shutdown();
}

#[tokio::test]
async fn capsule_from_unknown_signer_is_rejected() {
    let mesh = start_mesh(MeshOptions::default(), canned_answers());

    let rogue = SigningIdentity::generate();
    let capsule = KnowledgeCapsule::create(
        "Planted question?",
        "Planted answer.".to_string(),
        "rogue-hub",
        3600,
        &rogue,
    );

    let encoded = encode_packet(
        PacketType::Capsule,
        Uuid::new_v4(),
        mesh.main_id(),
        mesh.mini_id(0),
        &capsule.to_bytes().unwrap(),
        &mesh.pair_keys[0],
    )
    .unwrap();
    mesh.sim
        .submit(mesh.main_id(), mesh.mini_id(0), encoded)
        .unwrap();
    settle().await;

    assert!(mesh.mini_stores[0].is_empty());
    assert_eq!(mesh.mini(0).metrics().unknown_signer, 1);
    mesh.shutdown();
}

#[tokio::test]
async fn corrupted_ciphertext_is_dropped_without_nak() {
    let mesh = start_mesh(MeshOptions::default(), canned_answers());

    let capsule = KnowledgeCapsule::create(
        "Intact question?",
        "Intact answer.".to_string(),
        "main",
        3600,
        mesh.signer(),
    );
    let encoded = encode_packet(
        PacketType::Capsule,
        Uuid::new_v4(),
        mesh.main_id(),
        mesh.mini_id(0),
        &capsule.to_bytes().unwrap(),
        &mesh.pair_keys[0],
    )
    .unwrap();

    // Corrupt the ciphertext body after encoding; transport still succeeds,
    // decryption does not.
    let mut bytes = encoded.to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    mesh.sim
        .submit(mesh.main_id(), mesh.mini_id(0), bytes.into())
        .unwrap();
    settle().await;

    assert!(mesh.mini_stores[0].is_empty());
    assert_eq!(mesh.mini(0).metrics().decrypt_fail, 1);
    assert_eq!(
        mesh.sim.stats().packets_delivered,
        1,
        "transport-level delivery succeeded; the drop is above it"
    );
    mesh.shutdown();
}
