//! Student identity, state record, and the partial-update merge rules.

use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};

use super::base64_bytes;

/// Status label assigned by the relay when a student first joins.
pub const STATUS_CONNECTED: &str = "Connected";

/// Focus score assigned by the relay when a student first joins.
pub const INITIAL_FOCUS_SCORE: u8 = 100;

/// Highest focus score a record can hold.
pub const MAX_FOCUS_SCORE: u8 = 100;

/// Opaque, stable identity of one connected student for one exam session.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(String);

impl StudentId {
    /// Wrap a raw identity string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the raw identity string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identity is empty or whitespace only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Identity reduced to characters that are safe inside a file name.
    #[must_use]
    pub fn file_safe(&self) -> String {
        self.0
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            .collect()
    }
}

impl Debug for StudentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Display for StudentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StudentId {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

impl From<String> for StudentId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// A single still image captured from the live video source (JPEG bytes).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(#[serde(with = "base64_bytes")] Vec<u8>);

impl Snapshot {
    /// Wrap encoded image bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the encoded image bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the snapshot carries no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Snapshot({} bytes)", self.0.len())
    }
}

/// Latest known state of one connected student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StudentState {
    /// Join key across every other entity.
    pub student_id: StudentId,
    /// Focus score in `0..=100`.
    pub focus_score: u8,
    /// Open-ended status label (`Focused`, `Distracted`, `CriticalImpersonation`, …).
    pub status: String,
    /// Most recent snapshot, if any has arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_snapshot: Option<Snapshot>,
    /// Snapshot captured once at session start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_snapshot: Option<Snapshot>,
    /// Number of warnings raised against this student.
    #[serde(default)]
    pub warning_count: u32,
}

impl StudentState {
    /// Record for a student that has just joined.
    #[must_use]
    pub fn joined(student_id: StudentId) -> Self {
        Self {
            student_id,
            focus_score: INITIAL_FOCUS_SCORE,
            status: STATUS_CONNECTED.to_owned(),
            latest_snapshot: None,
            baseline_snapshot: None,
            warning_count: 0,
        }
    }

    /// Bring an inbound record back inside its invariants.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.focus_score = self.focus_score.min(MAX_FOCUS_SCORE);
        self
    }

    /// Apply a partial update: every field present in `patch` overwrites,
    /// every omitted field is left untouched.
    ///
    /// Returns `true` when the record changed. Applying the same patch twice
    /// changes nothing the second time.
    pub fn apply(&mut self, patch: &StudentPatch) -> bool {
        let before = self.clone();

        if let Some(score) = patch.focus_score {
            self.focus_score = score.min(MAX_FOCUS_SCORE);
        }
        if let Some(ref status) = patch.status {
            self.status.clone_from(status);
        }
        if let Some(ref snapshot) = patch.latest_snapshot {
            self.latest_snapshot = Some(snapshot.clone());
        }
        if let Some(ref snapshot) = patch.baseline_snapshot {
            self.baseline_snapshot = Some(snapshot.clone());
        }
        if let Some(count) = patch.warning_count {
            self.warning_count = count;
        }

        *self != before
    }

    /// Merge a duplicate join into an existing record.
    ///
    /// A replayed join must never regress fields that later updates already
    /// moved, so only fields still missing locally are filled in.
    pub fn absorb_duplicate_join(&mut self, other: StudentState) -> bool {
        let mut changed = false;
        if self.latest_snapshot.is_none() && other.latest_snapshot.is_some() {
            self.latest_snapshot = other.latest_snapshot;
            changed = true;
        }
        if self.baseline_snapshot.is_none() && other.baseline_snapshot.is_some() {
            self.baseline_snapshot = other.baseline_snapshot;
            changed = true;
        }
        changed
    }

    /// Patch that would reproduce every field of this record.
    #[must_use]
    pub fn to_patch(&self) -> StudentPatch {
        StudentPatch {
            student_id: self.student_id.clone(),
            focus_score: Some(self.focus_score),
            status: Some(self.status.clone()),
            latest_snapshot: self.latest_snapshot.clone(),
            baseline_snapshot: self.baseline_snapshot.clone(),
            warning_count: Some(self.warning_count),
        }
    }
}

/// Partial student update. Omitted fields mean "unchanged", never "cleared".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StudentPatch {
    /// Record this update targets.
    pub student_id: StudentId,
    /// New focus score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_score: Option<u8>,
    /// New status label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// New latest snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_snapshot: Option<Snapshot>,
    /// Baseline snapshot (set once by the relay).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_snapshot: Option<Snapshot>,
    /// New warning count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_count: Option<u32>,
}

impl StudentPatch {
    /// Empty patch for `student_id`; chain the `with_*` builders to fill it.
    #[must_use]
    pub fn new(student_id: StudentId) -> Self {
        Self {
            student_id,
            focus_score: None,
            status: None,
            latest_snapshot: None,
            baseline_snapshot: None,
            warning_count: None,
        }
    }

    /// Set the focus score.
    #[must_use]
    pub fn with_focus_score(mut self, score: u8) -> Self {
        self.focus_score = Some(score);
        self
    }

    /// Set the status label.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Set the latest snapshot.
    #[must_use]
    pub fn with_latest_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.latest_snapshot = Some(snapshot);
        self
    }

    /// Set the baseline snapshot.
    #[must_use]
    pub fn with_baseline_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.baseline_snapshot = Some(snapshot);
        self
    }

    /// Set the warning count.
    #[must_use]
    pub fn with_warning_count(mut self, count: u32) -> Self {
        self.warning_count = Some(count);
        self
    }

    /// Whether the patch carries no field at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.focus_score.is_none()
            && self.status.is_none()
            && self.latest_snapshot.is_none()
            && self.baseline_snapshot.is_none()
            && self.warning_count.is_none()
    }
}
