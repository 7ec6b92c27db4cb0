//! Observer process side: fold the relay stream into a consistent view.

pub mod client;
pub mod engine;
pub mod evidence;
pub mod ledger;
pub mod removal;
pub mod review;
pub mod store;

pub use client::{LinkStatus, ObserverClient};
pub use engine::{ObserverEngine, ObserverNotice};
pub use review::{Resolution, ReviewCase, ReviewPhase};
