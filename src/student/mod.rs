//! Student process side: one capture session per exam participant.

pub mod session;

pub use session::{SessionEnd, SessionPhase, StopHook, StudentSession};
