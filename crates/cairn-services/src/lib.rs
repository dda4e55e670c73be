//! cairn-services — hub subsystems shared by mini and main hubs.
//!
//! The capsule store, the retransmit queue, the authority registry, the
//! selective-sync engine, and the metrics counters. Transport-free: nothing
//! here touches the link directly.

pub mod authority;
pub mod metrics;
pub mod queue;
pub mod similarity;
pub mod store;
pub mod sync;

pub use authority::AuthorityRegistry;
pub use metrics::{HubMetrics, MetricsSnapshot};
pub use queue::{
    AckOutcome, DuePass, EntrySnapshot, EntryStatus, PersistError, RetransmitQueue, RetryPolicy,
    Transmission,
};
pub use similarity::{Similarity, TokenOverlap};
pub use store::{CapsuleStore, PutOutcome, StoreError};
pub use sync::{SyncEngine, SyncError};
