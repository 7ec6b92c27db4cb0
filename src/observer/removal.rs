//! Observer side of the removal round-trip.
//!
//! A removal request only marks the identity as pending. The store keeps the
//! student until `student_left` confirms the channel is actually gone. A
//! pending mark never outlives the subscription it was sent on.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::models::student::StudentId;

/// Identities with a removal command in flight.
#[derive(Debug, Default, Clone)]
pub struct RemovalTracker {
    pending: HashSet<StudentId>,
}

impl RemovalTracker {
    /// Empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `student_id` as being removed.
    ///
    /// Returns `true` the first time, meaning the caller should send the
    /// command; repeats return `false` and must not send it again.
    pub fn request(&mut self, student_id: &StudentId) -> bool {
        let fresh = self.pending.insert(student_id.clone());
        if fresh {
            info!(%student_id, "removal requested");
        } else {
            debug!(%student_id, "removal already pending");
        }
        fresh
    }

    /// Record that `student_left` arrived; returns whether a removal was pending.
    pub fn confirm(&mut self, student_id: &StudentId) -> bool {
        self.pending.remove(student_id)
    }

    /// Whether a removal is in flight for `student_id`.
    #[must_use]
    pub fn is_pending(&self, student_id: &StudentId) -> bool {
        self.pending.contains(student_id)
    }

    /// Forget a request whose command never reached the relay.
    pub fn withdraw(&mut self, student_id: &StudentId) -> bool {
        let was_pending = self.pending.remove(student_id);
        if was_pending {
            info!(%student_id, "removal withdrawn");
        }
        was_pending
    }

    /// Forget every request; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Removals in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
