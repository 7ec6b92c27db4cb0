//! Seam for the external behavior analysis.
//!
//! Focus scoring, face detection, and audio inference are not part of this
//! crate. The relay offers every frame and audio segment to an
//! [`EvidenceAnalyzer`] and applies whatever [`Verdict`] comes back.

use crate::models::alert::Severity;
use crate::models::student::{Snapshot, StudentState};

/// Alert requested by a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerdictAlert {
    /// Alert severity.
    pub severity: Severity,
    /// Operator-facing description.
    pub message: String,
}

/// Outcome of analyzing one piece of evidence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    /// New focus score.
    pub focus_score: Option<u8>,
    /// New status label.
    pub status: Option<String>,
    /// Warnings to add to the student's count.
    pub add_warnings: u32,
    /// Alert to raise, with the evidence attached.
    pub alert: Option<VerdictAlert>,
}

impl Verdict {
    /// Verdict that only raises an alert.
    #[must_use]
    pub fn alert(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            alert: Some(VerdictAlert {
                severity,
                message: message.into(),
            }),
            ..Self::default()
        }
    }

    /// Set the status label.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Set the focus score.
    #[must_use]
    pub fn with_focus_score(mut self, score: u8) -> Self {
        self.focus_score = Some(score);
        self
    }

    /// Add `n` warnings.
    #[must_use]
    pub fn with_warnings(mut self, n: u32) -> Self {
        self.add_warnings = n;
        self
    }
}

/// External analysis of student evidence.
///
/// Implementations must return quickly; they run on the relay's
/// connection tasks.
pub trait EvidenceAnalyzer: Send + Sync {
    /// Judge a periodic frame.
    fn analyze_frame(&self, student: &StudentState, snapshot: &Snapshot) -> Option<Verdict>;

    /// Judge a completed audio segment and its boundary snapshot.
    fn analyze_audio(
        &self,
        student: &StudentState,
        audio: &[u8],
        snapshot: Option<&Snapshot>,
    ) -> Option<Verdict>;
}

/// Analyzer that never reaches a verdict.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAnalyzer;

impl EvidenceAnalyzer for NoopAnalyzer {
    fn analyze_frame(&self, _student: &StudentState, _snapshot: &Snapshot) -> Option<Verdict> {
        None
    }

    fn analyze_audio(
        &self,
        _student: &StudentState,
        _audio: &[u8],
        _snapshot: Option<&Snapshot>,
    ) -> Option<Verdict> {
        None
    }
}
