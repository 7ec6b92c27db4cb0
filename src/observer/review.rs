//! Critical Session Workflow.
//!
//! Review state is never stored. It is recomputed from the student's status
//! label, the alert ledger, and the pending-removal set every time it is
//! asked for, so it cannot drift from either source.

use regex::Regex;

use crate::config::ObserverConfig;
use crate::models::alert::{AlertEvent, Severity};
use crate::models::student::{StudentId, StudentState};
use crate::observer::ledger::AlertLedger;
use crate::observer::removal::RemovalTracker;
use crate::observer::store::StudentStore;
use crate::Result;

/// Where one identity stands in the review workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewPhase {
    /// Not connected.
    Absent,
    /// Connected, status not critical.
    Normal,
    /// Critical status awaiting an operator decision.
    UnderReview,
    /// Operator confirmed removal; waiting for `student_left`.
    Removing,
}

/// How a review ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Operator dismissed it as a false alarm.
    Dismissed,
    /// The removal round-trip completed.
    Removed,
    /// The relay itself moved the status out of the critical range.
    Cleared,
}

/// What the operator is shown for one critical student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewCase {
    /// Student record at the time of the read.
    pub student: StudentState,
    /// Most severe retained alert raised since the student's last
    /// resolution; informational alerts never qualify.
    pub alert: Option<AlertEvent>,
}

impl ReviewCase {
    /// Identity under review.
    #[must_use]
    pub fn student_id(&self) -> &StudentId {
        &self.student.student_id
    }
}

/// Decides which status labels are critical and derives review views.
#[derive(Debug, Clone)]
pub struct ReviewWorkflow {
    critical: Regex,
    dismissed_label: String,
}

impl ReviewWorkflow {
    /// Build from the observer configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`](crate::AppError::Config) if the critical
    /// status pattern does not compile.
    pub fn from_config(config: &ObserverConfig) -> Result<Self> {
        Ok(Self {
            critical: Regex::new(&config.critical_status_pattern)?,
            dismissed_label: config.dismissed_status_label.clone(),
        })
    }

    /// Whether `status` denotes a suspected integrity violation.
    #[must_use]
    pub fn is_critical(&self, status: &str) -> bool {
        self.critical.is_match(status)
    }

    /// Label a dismissed student falls back to.
    #[must_use]
    pub fn dismissed_label(&self) -> &str {
        &self.dismissed_label
    }

    /// Current phase for `student_id`.
    #[must_use]
    pub fn phase(
        &self,
        store: &StudentStore,
        removals: &RemovalTracker,
        student_id: &StudentId,
    ) -> ReviewPhase {
        let Some(student) = store.get(student_id) else {
            return ReviewPhase::Absent;
        };
        if removals.is_pending(student_id) {
            ReviewPhase::Removing
        } else if self.is_critical(&student.status) {
            ReviewPhase::UnderReview
        } else {
            ReviewPhase::Normal
        }
    }

    /// Joined view of a student currently under review.
    #[must_use]
    pub fn case(
        &self,
        store: &StudentStore,
        ledger: &AlertLedger,
        removals: &RemovalTracker,
        student_id: &StudentId,
    ) -> Option<ReviewCase> {
        if self.phase(store, removals, student_id) != ReviewPhase::UnderReview {
            return None;
        }
        let student = store.get(student_id)?.clone();
        let alert = ledger
            .most_severe_for(student_id)
            .filter(|a| a.severity > Severity::Info)
            .cloned();
        Some(ReviewCase { student, alert })
    }

    /// Every open review, one per identity.
    #[must_use]
    pub fn open_cases(
        &self,
        store: &StudentStore,
        ledger: &AlertLedger,
        removals: &RemovalTracker,
    ) -> Vec<ReviewCase> {
        store
            .iter()
            .filter_map(|s| self.case(store, ledger, removals, &s.student_id))
            .collect()
    }
}
