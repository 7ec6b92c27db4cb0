//! Global configuration parsing and validation.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Relay server settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RelayConfig {
    /// Address the NDJSON channel listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Port for the HTTP side channel (audio evidence, health).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Directory where flagged audio clips are stored.
    #[serde(default = "default_audio_dir")]
    pub audio_dir: PathBuf,
    /// Seconds a removed student may keep its channel open before the relay closes it.
    #[serde(default = "default_removal_grace_seconds")]
    pub removal_grace_seconds: u64,
    /// Capacity of the observer broadcast buffer.
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_port: default_http_port(),
            audio_dir: default_audio_dir(),
            removal_grace_seconds: default_removal_grace_seconds(),
            observer_buffer: default_observer_buffer(),
        }
    }
}

/// Student-side capture cadence.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CaptureConfig {
    /// Interval between snapshot emissions.
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    /// Length of one continuously recorded audio segment.
    #[serde(default = "default_audio_segment_seconds")]
    pub audio_segment_seconds: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: default_snapshot_interval_ms(),
            audio_segment_seconds: default_audio_segment_seconds(),
        }
    }
}

impl CaptureConfig {
    /// Snapshot cadence as a [`Duration`].
    #[must_use]
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    /// Audio segment length as a [`Duration`].
    #[must_use]
    pub fn audio_segment(&self) -> Duration {
        Duration::from_secs(self.audio_segment_seconds)
    }
}

/// Observer-side reconciliation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ObserverConfig {
    /// Number of alerts retained by the ledger.
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,
    /// Regular expression identifying critical status labels.
    #[serde(default = "default_critical_status_pattern")]
    pub critical_status_pattern: String,
    /// Status label written when an operator dismisses a critical case.
    #[serde(default = "default_dismissed_status_label")]
    pub dismissed_status_label: String,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            ledger_capacity: default_ledger_capacity(),
            critical_status_pattern: default_critical_status_pattern(),
            dismissed_status_label: default_dismissed_status_label(),
        }
    }
}

/// Channel session timing shared by students and observers.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Window for completing the initial `join` / `admin_join` exchange.
    #[serde(default = "default_handshake_timeout_seconds")]
    pub handshake_timeout_seconds: u64,
    /// Reconnection attempts before a dropped session is considered ended.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    /// Base delay between reconnection attempts; doubles per attempt.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_seconds: default_handshake_timeout_seconds(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

impl SessionConfig {
    /// Handshake window as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7400))
}

fn default_http_port() -> u16 {
    7401
}

fn default_audio_dir() -> PathBuf {
    PathBuf::from("suspicious_audio")
}

fn default_removal_grace_seconds() -> u64 {
    5
}

fn default_observer_buffer() -> usize {
    256
}

fn default_snapshot_interval_ms() -> u64 {
    2000
}

fn default_audio_segment_seconds() -> u64 {
    10
}

fn default_ledger_capacity() -> usize {
    15
}

fn default_critical_status_pattern() -> String {
    "(?i)^critical".into()
}

fn default_dismissed_status_label() -> String {
    "Focused".into()
}

fn default_handshake_timeout_seconds() -> u64 {
    10
}

fn default_reconnect_max_attempts() -> u32 {
    5
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Relay server settings.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Student capture cadence.
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Observer reconciliation settings.
    #[serde(default)]
    pub observer: ObserverConfig,
    /// Handshake and reconnection timing.
    #[serde(default)]
    pub session: SessionConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.capture.snapshot_interval_ms == 0 {
            return Err(AppError::Config(
                "capture.snapshot_interval_ms must be greater than zero".into(),
            ));
        }

        if self.capture.audio_segment_seconds == 0 {
            return Err(AppError::Config(
                "capture.audio_segment_seconds must be greater than zero".into(),
            ));
        }

        if self.observer.ledger_capacity == 0 {
            return Err(AppError::Config(
                "observer.ledger_capacity must be greater than zero".into(),
            ));
        }

        if self.relay.observer_buffer == 0 {
            return Err(AppError::Config(
                "relay.observer_buffer must be greater than zero".into(),
            ));
        }

        if self.session.handshake_timeout_seconds == 0 {
            return Err(AppError::Config(
                "session.handshake_timeout_seconds must be greater than zero".into(),
            ));
        }

        regex::Regex::new(&self.observer.critical_status_pattern)?;

        Ok(())
    }
}
