#![forbid(unsafe_code)]

//! Live exam-proctoring session protocol.
//!
//! Student processes capture evidence and stream it through a relay; an
//! observer folds the resulting event stream into a per-student view,
//! surfaces critical cases for review, and can remove a student.

pub mod capture;
pub mod config;
pub mod errors;
pub mod models;
pub mod observer;
pub mod protocol;
pub mod relay;
pub mod student;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
