//! Loss, retransmission, and offline-recovery scenarios.

use std::time::Duration;

use cairn_services::EntryStatus;
use cairnd::QueryResult;
use uuid::Uuid;

use crate::{canned_answers, start_mesh, wait_for, MeshOptions};

#[tokio::test]
async fn s3_lossy_link_retransmits_until_delivered() {
    let mut options = MeshOptions {
        seed: 1234,
        ..MeshOptions::default()
    };
    options.sim.loss_probability = 0.4;
    let mesh = start_mesh(options, canned_answers());

    let result = mesh.mini(0).query("u1", "Define entropy", None).await.unwrap();
    match result {
        QueryResult::Fresh(capsule) => {
            assert_eq!(capsule.answer_text, "A measure of disorder in a system.")
        }
        other => panic!("expected Fresh despite 40% loss, got {other:?}"),
    }

    let entries = mesh.mini(0).queue_snapshots();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].attempts >= 1);
    assert_eq!(entries[0].status, EntryStatus::Delivered);
    mesh.shutdown();
}

#[tokio::test]
async fn s4_offline_query_queues_then_reconciles() {
    let mut options = MeshOptions::default();
    options.sim.loss_probability = 1.0;
    options.mini.reply_timeout_ms = 600;
    let mesh = start_mesh(options, canned_answers());

    let result = mesh.mini(0).query("u1", "Explain TLS", None).await.unwrap();
    let packet_id = match result {
        QueryResult::Queued(packet_id) => packet_id,
        other => panic!("expected Queued under total loss, got {other:?}"),
    };

    let snapshot = mesh.mini(0).queue_snapshot(&packet_id).unwrap();
    assert_eq!(snapshot.status, EntryStatus::Pending);
    assert!(snapshot.attempts >= 1);

    // Link recovery: retransmission succeeds, and the late capsule is
    // cached even though nobody is waiting on the call anymore.
    mesh.sim.mutate_config(|c| c.loss_probability = 0.0);

    wait_for("queue entry delivered", Duration::from_secs(5), || {
        mesh.mini(0).queue_snapshot(&packet_id).map(|s| s.status)
            == Some(EntryStatus::Delivered)
    })
    .await;
    wait_for("late capsule cached", Duration::from_secs(5), || {
        !mesh.mini_stores[0].is_empty()
    })
    .await;

    let capsule_id = mesh.mini_stores[0].list()[0].capsule_id;
    let capsule = mesh.mini(0).get_capsule(&capsule_id).unwrap();
    assert_eq!(
        capsule.answer_text,
        "A protocol for authenticated encrypted channels."
    );
    mesh.shutdown();
}

#[tokio::test]
async fn total_loss_exhausts_retries_and_reports_offline() {
    let mut options = MeshOptions::default();
    options.sim.loss_probability = 1.0;
    let mesh = start_mesh(options, canned_answers());

    let result = mesh.mini(0).query("u1", "Define entropy", None).await.unwrap();
    match result {
        QueryResult::Unavailable { code, .. } => assert_eq!(code, "offline"),
        other => panic!("expected Unavailable(offline), got {other:?}"),
    }

    let entries = mesh.mini(0).queue_snapshots();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Failed);
    assert_eq!(entries[0].attempts, 6, "exactly max_retries transmissions");
    mesh.shutdown();
}

#[tokio::test]
async fn late_reply_for_cancelled_wait_is_still_cached() {
    let mut options = MeshOptions::default();
    // Choke the link: the small query slips through the bandwidth burst,
    // the larger capsule reply takes seconds to pace through.
    options.sim.bandwidth_bytes_per_sec = 256;
    options.sim.reassembly_timeout_ms = 5_000;
    options.mini.reply_timeout_ms = 700;
    let mesh = start_mesh(options, canned_answers());

    let result = mesh.mini(0).query("u1", "Define entropy", None).await.unwrap();
    assert!(matches!(result, QueryResult::Queued(_)), "got {result:?}");

    wait_for("late capsule cached", Duration::from_secs(5), || {
        !mesh.mini_stores[0].is_empty()
    })
    .await;
    mesh.shutdown();
}

#[tokio::test]
async fn unknown_destination_is_synchronous() {
    let mesh = start_mesh(MeshOptions::default(), canned_answers());
    let encoded = cairn_core::codec::encode_packet(
        cairn_core::wire::PacketType::Query,
        Uuid::new_v4(),
        mesh.mini_id(0),
        cairn_core::wire::node_id("nobody"),
        b"payload",
        &mesh.pair_keys[0],
    )
    .unwrap();

    assert!(matches!(
        mesh.sim
            .submit(mesh.mini_id(0), cairn_core::wire::node_id("nobody"), encoded),
        Err(cairn_netsim::SubmitError::UnknownDestination(_))
    ));
    mesh.shutdown();
}
