//! cairn-netsim — the simulated lossy link between hubs.
//!
//! Emulates LoRa-class degradation: latency, jitter, per-chunk loss, global
//! bandwidth pacing, reordering, fragmentation and reassembly, with ACK/NAK
//! feedback to senders. The simulator is the sole transport in the mesh;
//! hubs see only [`LinkEvent`]s.

pub mod pacing;
pub mod sim;
pub mod stats;

pub use sim::{LinkEvent, NetSim, SubmitError};
pub use stats::StatsSnapshot;
