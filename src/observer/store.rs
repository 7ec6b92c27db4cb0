//! Student State Store: identity → latest known [`StudentState`].
//!
//! Every writer goes through one resolution rule, merge-if-exists and
//! drop-if-absent, so replayed, duplicated, and reordered events converge to
//! the same state. Only `student_joined` and `initial_roster` create entries.

use std::collections::BTreeMap;

use tracing::debug;

use crate::models::student::{Snapshot, StudentId, StudentPatch, StudentState};

/// Result of folding a `student_joined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// New entry created.
    Inserted,
    /// Duplicate join filled in fields that were missing.
    Merged,
    /// Duplicate join carried nothing new.
    Unchanged,
}

/// Result of folding a partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// At least one field changed.
    Changed,
    /// Every field already had the given value.
    Unchanged,
    /// No entry for the identity; the update was discarded.
    Dropped,
}

/// Result of folding a `student_left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The entry existed and was deleted.
    pub removed: bool,
    /// The detail focus pointed at the departed identity and was cleared.
    pub focus_cleared: bool,
}

/// Observer-side view of every connected student.
#[derive(Debug, Default, Clone)]
pub struct StudentStore {
    students: BTreeMap<StudentId, StudentState>,
    focused: Option<StudentId>,
}

impl StudentStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole store with `roster`.
    ///
    /// Entries missing from the roster are discarded. The detail focus
    /// survives only if its identity is still present. Returns whether the
    /// focus had to be cleared.
    pub fn seed(&mut self, roster: Vec<StudentState>) -> bool {
        self.students = roster
            .into_iter()
            .filter(|s| !s.student_id.is_blank())
            .map(|s| (s.student_id.clone(), s.normalized()))
            .collect();
        self.drop_stale_focus()
    }

    /// Fold a `student_joined`.
    pub fn join(&mut self, student: StudentState) -> JoinOutcome {
        if let Some(existing) = self.students.get_mut(&student.student_id) {
            debug!(student_id = %student.student_id, "duplicate join merged");
            return if existing.absorb_duplicate_join(student) {
                JoinOutcome::Merged
            } else {
                JoinOutcome::Unchanged
            };
        }
        self.students
            .insert(student.student_id.clone(), student.normalized());
        JoinOutcome::Inserted
    }

    /// Fold a `student_updated`.
    pub fn update(&mut self, patch: &StudentPatch) -> MergeOutcome {
        let Some(existing) = self.students.get_mut(&patch.student_id) else {
            debug!(student_id = %patch.student_id, "update for unknown student dropped");
            return MergeOutcome::Dropped;
        };
        if existing.apply(patch) {
            MergeOutcome::Changed
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// Attach alert evidence as the student's latest snapshot.
    pub fn attach_evidence(&mut self, student_id: &StudentId, snapshot: &Snapshot) -> MergeOutcome {
        let patch = StudentPatch::new(student_id.clone()).with_latest_snapshot(snapshot.clone());
        self.update(&patch)
    }

    /// Fold a `student_left`.
    pub fn leave(&mut self, student_id: &StudentId) -> LeaveOutcome {
        let removed = self.students.remove(student_id).is_some();
        let focus_cleared = removed && self.drop_stale_focus();
        LeaveOutcome {
            removed,
            focus_cleared,
        }
    }

    /// Point the detail panel at `student_id`; `false` if unknown.
    pub fn focus(&mut self, student_id: &StudentId) -> bool {
        if self.students.contains_key(student_id) {
            self.focused = Some(student_id.clone());
            true
        } else {
            false
        }
    }

    /// Clear the detail focus.
    pub fn clear_focus(&mut self) {
        self.focused = None;
    }

    /// Identity the detail panel shows.
    #[must_use]
    pub fn focused(&self) -> Option<&StudentId> {
        self.focused.as_ref()
    }

    /// Look up one student.
    #[must_use]
    pub fn get(&self, student_id: &StudentId) -> Option<&StudentState> {
        self.students.get(student_id)
    }

    /// Whether `student_id` is currently connected.
    #[must_use]
    pub fn contains(&self, student_id: &StudentId) -> bool {
        self.students.contains_key(student_id)
    }

    /// Every student, ordered by identity.
    pub fn iter(&self) -> impl Iterator<Item = &StudentState> {
        self.students.values()
    }

    /// Number of connected students.
    #[must_use]
    pub fn len(&self) -> usize {
        self.students.len()
    }

    /// Whether no student is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    fn drop_stale_focus(&mut self) -> bool {
        match self.focused {
            Some(ref id) if !self.students.contains_key(id) => {
                self.focused = None;
                true
            }
            _ => false,
        }
    }
}
