//! Alert events and the evidence attached to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::student::{Snapshot, StudentId};

/// Alert severity, ordered `Info < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational (operator actions, verified identity).
    Info,
    /// Suspicious behavior worth noting.
    Warning,
    /// Suspected integrity violation requiring review.
    Critical,
}

/// Reference to an audio clip retrievable from the relay's HTTP side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AudioClipRef {
    /// Server-assigned file name.
    pub filename: String,
}

impl AudioClipRef {
    /// Whether `filename` is a bare file name with no path traversal.
    #[must_use]
    pub fn is_safe_filename(filename: &str) -> bool {
        !filename.is_empty()
            && !filename.contains("..")
            && !filename.contains('/')
            && !filename.contains('\\')
    }

    /// Side-channel URL of the clip under `http_base` (e.g. `http://host:7401`).
    #[must_use]
    pub fn url(&self, http_base: &str) -> String {
        format!("{}/audio/{}", http_base.trim_end_matches('/'), self.filename)
    }
}

/// Evidence captured alongside an alert.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Evidence {
    /// Snapshot taken when the alert fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    /// Flagged audio clip, fetched separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_clip: Option<AudioClipRef>,
}

/// An immutable alert about one student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AlertEvent {
    /// Unique alert identifier.
    pub alert_id: String,
    /// Student the alert refers to.
    pub student_id: StudentId,
    /// Alert severity.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Optional supporting evidence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    /// When the alert was raised.
    pub raised_at: DateTime<Utc>,
}

impl AlertEvent {
    /// Construct a new alert with a generated identifier.
    #[must_use]
    pub fn new(student_id: StudentId, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            alert_id: Uuid::new_v4().to_string(),
            student_id,
            severity,
            message: message.into(),
            evidence: None,
            raised_at: Utc::now(),
        }
    }

    /// Attach evidence to a freshly built alert.
    #[must_use]
    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }

    /// Evidence snapshot, if one was attached.
    #[must_use]
    pub fn evidence_snapshot(&self) -> Option<&Snapshot> {
        self.evidence.as_ref().and_then(|e| e.snapshot.as_ref())
    }
}
