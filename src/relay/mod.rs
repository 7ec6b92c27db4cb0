//! Reference relay: routes student channels to observers.
//!
//! The proctoring core treats the relay as an external collaborator; this
//! implementation exists so the protocol can run end to end.

pub mod analyzer;
pub mod http;
pub mod hub;
pub mod server;

pub use analyzer::{EvidenceAnalyzer, NoopAnalyzer, Verdict, VerdictAlert};
pub use hub::RelayHub;
pub use server::{serve_connection, spawn_relay};
