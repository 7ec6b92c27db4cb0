//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Duplicate and out-of-order deliveries are deliberately absent: they are
/// absorbed by the store merge rules and never surface as errors.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Camera or microphone unavailable or access denied. Fatal to capture.
    Device(String),
    /// A single frame or audio segment failed to encode. The unit is dropped.
    Encode(String),
    /// Transport-level failure on a session channel.
    Channel(String),
    /// Malformed payload or a message that violates the session contract.
    Protocol(String),
    /// The initial `join` / `admin_join` exchange did not complete in time.
    Handshake(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error ends a capture session outright.
    ///
    /// Encode failures and protocol violations only drop the offending unit.
    #[must_use]
    pub fn is_fatal_to_capture(&self) -> bool {
        matches!(self, Self::Device(_) | Self::Channel(_) | Self::Io(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Device(msg) => write!(f, "device: {msg}"),
            Self::Encode(msg) => write!(f, "encode: {msg}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed json: {err}"))
    }
}

impl From<regex::Error> for AppError {
    fn from(err: regex::Error) -> Self {
        Self::Config(format!("invalid pattern: {err}"))
    }
}
