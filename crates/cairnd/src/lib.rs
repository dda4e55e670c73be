//! cairnd — hub engines for the capsule mesh.
//!
//! [`mini::MiniHub`] serves user queries from cache and forwards misses over
//! the simulated link; [`main_hub::MainHub`] answers them with signed
//! capsules and gossips manifests. The binary in `main.rs` wires a mesh of
//! both onto one simulator.

pub mod answer;
pub mod keychain;
pub mod main_hub;
pub mod mini;
pub mod workers;

pub use answer::{AnswerError, AnswerProvider, EchoAnswers, FailingAnswers, StaticAnswers};
pub use keychain::PresharedKeychain;
pub use main_hub::MainHub;
pub use mini::{MiniHub, QueryError, QueryResult};
