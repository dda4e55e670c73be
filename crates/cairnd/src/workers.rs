//! Retransmit worker — drains a hub's queue onto the simulated link.
//!
//! One worker per hub. It sleeps until the earliest queue deadline (or a
//! notify from an enqueue/NAK/reconciliation), advances due entries, submits
//! their encoded bytes, and reports terminal failures back to the hub.

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use cairn_core::wire::NodeId;
use cairn_netsim::{NetSim, SubmitError};
use cairn_services::{HubMetrics, RetransmitQueue};

pub async fn retransmit_worker(
    node: NodeId,
    queue: RetransmitQueue,
    sim: NetSim,
    metrics: HubMetrics,
    failed_tx: mpsc::Sender<Uuid>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let pass = queue.take_due(Instant::now());

        for t in &pass.transmissions {
            if t.attempt > 1 {
                metrics.retransmission();
            }
            match sim.submit(node, t.destination, t.encoded.clone()) {
                Ok(()) => {
                    tracing::debug!(
                        packet_id = %t.packet_id,
                        attempt = t.attempt,
                        "transmission submitted"
                    );
                }
                Err(SubmitError::SimulatorDown) => {
                    tracing::warn!(packet_id = %t.packet_id, "simulator down, will retry");
                }
                Err(e) => {
                    tracing::warn!(packet_id = %t.packet_id, error = %e, "submission rejected");
                }
            }
        }

        for packet_id in pass.failed {
            if failed_tx.send(packet_id).await.is_err() {
                return;
            }
        }

        let deadline = queue.next_deadline();
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("retransmit worker shutting down");
                return;
            }
            _ = queue.work_available() => {}
            _ = sleep_until_deadline(deadline) => {}
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
