//! Alert Ledger: bounded, insertion-ordered alert history.
//!
//! Alerts are never edited or dropped on resolution. Resolving a student
//! records a watermark instead: alerts about that student appended before
//! it stay in the history but no longer count as open.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::models::alert::AlertEvent;
use crate::models::student::StudentId;

/// Ring buffer of the most recent alerts; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct AlertLedger {
    capacity: usize,
    entries: VecDeque<(u64, AlertEvent)>,
    next_seq: u64,
    resolved_before: HashMap<StudentId, u64>,
}

impl AlertLedger {
    /// Ledger holding at most `capacity` alerts (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            next_seq: 0,
            resolved_before: HashMap::new(),
        }
    }

    /// Append `alert`, evicting the oldest entry when full.
    ///
    /// Returns `false` without touching the ledger when an alert with the
    /// same `alert_id` is still retained.
    pub fn append(&mut self, alert: AlertEvent) -> bool {
        if self.entries.iter().any(|(_, a)| a.alert_id == alert.alert_id) {
            debug!(alert_id = alert.alert_id, "duplicate alert ignored");
            return false;
        }
        if self.entries.len() == self.capacity {
            if let Some((_, evicted)) = self.entries.pop_front() {
                debug!(alert_id = evicted.alert_id, "alert evicted");
            }
        }
        self.entries.push_back((self.next_seq, alert));
        self.next_seq += 1;
        true
    }

    /// Close every alert about `student_id` retained so far.
    pub fn resolve(&mut self, student_id: &StudentId) {
        self.resolved_before.insert(student_id.clone(), self.next_seq);
    }

    /// Alerts, most recent first.
    pub fn recent(&self) -> impl Iterator<Item = &AlertEvent> {
        self.entries.iter().rev().map(|(_, a)| a)
    }

    /// Latest alert about `student_id`.
    #[must_use]
    pub fn latest_for(&self, student_id: &StudentId) -> Option<&AlertEvent> {
        self.recent().find(|a| a.student_id == *student_id)
    }

    /// Most severe unresolved alert about `student_id`; the later one wins a
    /// tie.
    #[must_use]
    pub fn most_severe_for(&self, student_id: &StudentId) -> Option<&AlertEvent> {
        let floor = self.resolved_before.get(student_id).copied().unwrap_or(0);
        self.entries
            .iter()
            .rev()
            .filter(|(seq, a)| *seq >= floor && a.student_id == *student_id)
            .map(|(_, a)| a)
            .fold(None, |best: Option<&AlertEvent>, a| match best {
                Some(b) if b.severity >= a.severity => Some(b),
                _ => Some(a),
            })
    }

    /// Alerts retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of retained alerts.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
