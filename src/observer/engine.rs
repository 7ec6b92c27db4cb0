//! Single-owner fold of relay events and operator decisions.
//!
//! [`ObserverEngine`] owns the store, the ledger, and the pending-removal
//! set. Each inbound [`RelayEvent`] is folded synchronously and produces a
//! list of [`ObserverNotice`]s for the presentation layer. Operator
//! decisions return the [`ObserverMessage`] to send, if any.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::config::ObserverConfig;
use crate::models::alert::AlertEvent;
use crate::models::student::{StudentId, StudentPatch, StudentState};
use crate::observer::ledger::AlertLedger;
use crate::observer::removal::RemovalTracker;
use crate::observer::review::{Resolution, ReviewCase, ReviewPhase, ReviewWorkflow};
use crate::observer::store::{JoinOutcome, MergeOutcome, StudentStore};
use crate::protocol::messages::{ObserverMessage, RelayEvent};
use crate::{AppError, Result};

/// Reason sent with an operator-confirmed removal.
pub const REMOVAL_REASON: &str = "Removed by administrator.";

/// Change notification for whoever renders the observer state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverNotice {
    /// The store was replaced by a roster.
    RosterSeeded {
        /// Students in the roster.
        count: usize,
    },
    /// A student's record was created or changed.
    StudentChanged {
        /// Affected student.
        student_id: StudentId,
    },
    /// A student left the store.
    StudentRemoved {
        /// Departed student.
        student_id: StudentId,
    },
    /// A new alert entered the ledger.
    AlertAppended {
        /// The alert.
        alert: AlertEvent,
    },
    /// A critical status needs an operator decision.
    ReviewOpened {
        /// What to show.
        case: ReviewCase,
    },
    /// An open review gained new information (typically its alert).
    ReviewUpdated {
        /// Refreshed view.
        case: ReviewCase,
    },
    /// The student left while under review; the review is void.
    ReviewCancelled {
        /// Student whose review was dropped.
        student_id: StudentId,
    },
    /// A review ended.
    ReviewResolved {
        /// Student whose review ended.
        student_id: StudentId,
        /// How it ended.
        resolution: Resolution,
    },
    /// The detail panel pointed at a student who is gone.
    FocusCleared {
        /// Student that was focused.
        student_id: StudentId,
    },
    /// The relay reported a problem with something the observer sent.
    RelayError {
        /// Relay's description.
        message: String,
    },
}

/// Observer state plus the rules that fold events into it.
#[derive(Debug, Clone)]
pub struct ObserverEngine {
    store: StudentStore,
    ledger: AlertLedger,
    removals: RemovalTracker,
    workflow: ReviewWorkflow,
}

impl ObserverEngine {
    /// Empty engine configured from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the critical status pattern is invalid.
    pub fn new(config: &ObserverConfig) -> Result<Self> {
        Ok(Self {
            store: StudentStore::new(),
            ledger: AlertLedger::new(config.ledger_capacity),
            removals: RemovalTracker::new(),
            workflow: ReviewWorkflow::from_config(config)?,
        })
    }

    /// Fold one relay event.
    pub fn apply(&mut self, event: RelayEvent) -> Vec<ObserverNotice> {
        let mut notices = Vec::new();
        match event {
            RelayEvent::InitialRoster { students } => self.on_roster(students, &mut notices),
            RelayEvent::StudentJoined { student } => self.on_joined(student, &mut notices),
            RelayEvent::StudentUpdated { patch } => self.on_updated(&patch, &mut notices),
            RelayEvent::StudentLeft { student_id } => self.on_left(&student_id, &mut notices),
            RelayEvent::Alert { alert } => self.on_alert(alert, &mut notices),
            RelayEvent::ProtocolError { message } => {
                warn!(error = %message, "relay reported a protocol error");
                notices.push(ObserverNotice::RelayError { message });
            }
        }
        notices
    }

    /// Operator confirmed removal of a student under review.
    ///
    /// Returns the command to send, or `None` if a removal is already in
    /// flight. The store is untouched until `student_left` arrives.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if `student_id` has no open review.
    pub fn confirm_remove(&mut self, student_id: &StudentId) -> Result<Option<ObserverMessage>> {
        match self.phase(student_id) {
            ReviewPhase::UnderReview => self.remove(student_id, REMOVAL_REASON),
            ReviewPhase::Removing => Ok(None),
            ReviewPhase::Normal | ReviewPhase::Absent => Err(AppError::NotFound(format!(
                "no open review for {student_id}"
            ))),
        }
    }

    /// Remove any connected student, reviewed or not.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if `student_id` is not connected.
    pub fn remove(&mut self, student_id: &StudentId, reason: &str) -> Result<Option<ObserverMessage>> {
        if !self.store.contains(student_id) {
            return Err(AppError::NotFound(format!("student {student_id} is not connected")));
        }
        if !self.removals.request(student_id) {
            return Ok(None);
        }
        Ok(Some(ObserverMessage::RemoveStudent {
            student_id: student_id.clone(),
            reason: reason.to_owned(),
        }))
    }

    /// Undo [`remove`](Self::remove) when its command could not be sent.
    ///
    /// Returns the review notices for the student going back to its
    /// previous phase.
    pub fn withdraw_removal(&mut self, student_id: &StudentId) -> Vec<ObserverNotice> {
        let mut notices = Vec::new();
        let before = self.phase(student_id);
        if self.removals.withdraw(student_id) {
            self.transition(student_id, before, &mut notices);
        }
        notices
    }

    /// Operator dismissed a critical status as a false alarm.
    ///
    /// The status is reset locally right away; alert history is kept.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if `student_id` has no open review.
    pub fn dismiss(
        &mut self,
        student_id: &StudentId,
    ) -> Result<(ObserverMessage, Vec<ObserverNotice>)> {
        if self.phase(student_id) != ReviewPhase::UnderReview {
            return Err(AppError::NotFound(format!("no open review for {student_id}")));
        }

        let patch =
            StudentPatch::new(student_id.clone()).with_status(self.workflow.dismissed_label());
        self.ledger.resolve(student_id);
        let mut notices = Vec::new();
        if self.store.update(&patch) == MergeOutcome::Changed {
            notices.push(ObserverNotice::StudentChanged {
                student_id: student_id.clone(),
            });
        }
        notices.push(ObserverNotice::ReviewResolved {
            student_id: student_id.clone(),
            resolution: Resolution::Dismissed,
        });
        info!(%student_id, "critical status dismissed");

        let msg = ObserverMessage::DismissAlert {
            student_id: student_id.clone(),
        };
        Ok((msg, notices))
    }

    /// Point the detail panel at `student_id`; `false` if not connected.
    pub fn focus(&mut self, student_id: &StudentId) -> bool {
        self.store.focus(student_id)
    }

    /// Review phase of `student_id`.
    #[must_use]
    pub fn phase(&self, student_id: &StudentId) -> ReviewPhase {
        self.workflow.phase(&self.store, &self.removals, student_id)
    }

    /// Open review for `student_id`, if any.
    #[must_use]
    pub fn case(&self, student_id: &StudentId) -> Option<ReviewCase> {
        self.workflow
            .case(&self.store, &self.ledger, &self.removals, student_id)
    }

    /// Every open review.
    #[must_use]
    pub fn open_cases(&self) -> Vec<ReviewCase> {
        self.workflow
            .open_cases(&self.store, &self.ledger, &self.removals)
    }

    /// Student State Store.
    #[must_use]
    pub fn store(&self) -> &StudentStore {
        &self.store
    }

    /// Alert Ledger.
    #[must_use]
    pub fn ledger(&self) -> &AlertLedger {
        &self.ledger
    }

    /// Whether a removal for `student_id` is in flight.
    #[must_use]
    pub fn removal_pending(&self, student_id: &StudentId) -> bool {
        self.removals.is_pending(student_id)
    }

    // ── Event folds ───────────────────────────────────────────

    fn on_roster(&mut self, students: Vec<StudentState>, notices: &mut Vec<ObserverNotice>) {
        let mut touched: BTreeSet<StudentId> =
            self.store.iter().map(|s| s.student_id.clone()).collect();
        touched.extend(students.iter().map(|s| s.student_id.clone()));
        let before: Vec<(StudentId, ReviewPhase)> = touched
            .into_iter()
            .map(|id| {
                let phase = self.phase(&id);
                (id, phase)
            })
            .collect();
        let focused = self.store.focused().cloned();

        let focus_cleared = self.store.seed(students);
        // Unconfirmed removals may have been lost with the old subscription;
        // students still present go back under review and can be removed again.
        let dropped = self.removals.clear();

        info!(students = self.store.len(), dropped_removals = dropped, "roster seeded");
        notices.push(ObserverNotice::RosterSeeded {
            count: self.store.len(),
        });
        if let (true, Some(student_id)) = (focus_cleared, focused) {
            notices.push(ObserverNotice::FocusCleared { student_id });
        }
        for (id, phase) in before {
            self.transition(&id, phase, notices);
        }
    }

    fn on_joined(&mut self, student: StudentState, notices: &mut Vec<ObserverNotice>) {
        let student_id = student.student_id.clone();
        if student_id.is_blank() {
            warn!("student_joined with blank identity dropped");
            return;
        }
        let before = self.phase(&student_id);
        match self.store.join(student) {
            JoinOutcome::Inserted => {
                info!(%student_id, "student joined");
                notices.push(ObserverNotice::StudentChanged {
                    student_id: student_id.clone(),
                });
            }
            JoinOutcome::Merged => notices.push(ObserverNotice::StudentChanged {
                student_id: student_id.clone(),
            }),
            JoinOutcome::Unchanged => {}
        }
        self.transition(&student_id, before, notices);
    }

    fn on_updated(&mut self, patch: &StudentPatch, notices: &mut Vec<ObserverNotice>) {
        let before = self.phase(&patch.student_id);
        if self.store.update(patch) == MergeOutcome::Changed {
            notices.push(ObserverNotice::StudentChanged {
                student_id: patch.student_id.clone(),
            });
        }
        self.transition(&patch.student_id, before, notices);
    }

    fn on_left(&mut self, student_id: &StudentId, notices: &mut Vec<ObserverNotice>) {
        let before = self.phase(student_id);
        let outcome = self.store.leave(student_id);
        if !outcome.removed {
            debug!(%student_id, "student_left for unknown student ignored");
            return;
        }
        info!(%student_id, "student left");
        notices.push(ObserverNotice::StudentRemoved {
            student_id: student_id.clone(),
        });
        if outcome.focus_cleared {
            notices.push(ObserverNotice::FocusCleared {
                student_id: student_id.clone(),
            });
        }
        self.transition(student_id, before, notices);
        self.removals.confirm(student_id);
    }

    fn on_alert(&mut self, alert: AlertEvent, notices: &mut Vec<ObserverNotice>) {
        let student_id = alert.student_id.clone();
        let snapshot = alert.evidence_snapshot().cloned();
        if !self.ledger.append(alert.clone()) {
            return;
        }
        debug!(alert_id = alert.alert_id, %student_id, severity = ?alert.severity, "alert appended");
        notices.push(ObserverNotice::AlertAppended { alert });

        let before = self.phase(&student_id);
        if let Some(snapshot) = snapshot {
            if self.store.attach_evidence(&student_id, &snapshot) == MergeOutcome::Changed {
                notices.push(ObserverNotice::StudentChanged {
                    student_id: student_id.clone(),
                });
            }
        }
        if before == ReviewPhase::UnderReview {
            if let Some(case) = self.case(&student_id) {
                notices.push(ObserverNotice::ReviewUpdated { case });
            }
        } else {
            self.transition(&student_id, before, notices);
        }
    }

    /// Emit review notices for `student_id` moving away from `before`.
    ///
    /// A review that ends closes the alerts it was raised with.
    fn transition(&mut self, student_id: &StudentId, before: ReviewPhase, notices: &mut Vec<ObserverNotice>) {
        let after = self.phase(student_id);
        if before == after {
            return;
        }
        if matches!(before, ReviewPhase::UnderReview | ReviewPhase::Removing)
            && matches!(after, ReviewPhase::Normal | ReviewPhase::Absent)
        {
            self.ledger.resolve(student_id);
        }
        match (before, after) {
            (_, ReviewPhase::UnderReview) => {
                if let Some(case) = self.case(student_id) {
                    info!(%student_id, "review opened");
                    notices.push(ObserverNotice::ReviewOpened { case });
                }
            }
            (ReviewPhase::UnderReview, ReviewPhase::Absent) => {
                info!(%student_id, "review cancelled: student left");
                notices.push(ObserverNotice::ReviewCancelled {
                    student_id: student_id.clone(),
                });
            }
            (ReviewPhase::UnderReview, ReviewPhase::Normal) => {
                notices.push(ObserverNotice::ReviewResolved {
                    student_id: student_id.clone(),
                    resolution: Resolution::Cleared,
                });
            }
            (ReviewPhase::Removing, ReviewPhase::Absent) => {
                info!(%student_id, "removal confirmed");
                notices.push(ObserverNotice::ReviewResolved {
                    student_id: student_id.clone(),
                    resolution: Resolution::Removed,
                });
            }
            _ => {}
        }
    }
}
