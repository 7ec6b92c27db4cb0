//! Relay bookkeeping shared by every connection.
//!
//! The hub owns the relay's own roster and the observer broadcast. Every
//! roster mutation and its broadcast happen under one lock, so an observer
//! that takes a roster snapshot and subscribes in the same critical section
//! never misses or double-counts an event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::models::alert::{AlertEvent, AudioClipRef, Evidence, Severity};
use crate::models::student::{Snapshot, StudentId, StudentPatch, StudentState};
use crate::observer::review::ReviewWorkflow;
use crate::protocol::messages::{RelayEvent, StudentCommand};
use crate::relay::analyzer::{EvidenceAnalyzer, Verdict};
use crate::{AppError, Result};

/// Info alert raised when an operator removes a student.
pub const REMOVED_MESSAGE: &str = "Removed by administrator.";
/// Info alert raised when an operator dismisses a critical status.
pub const DISMISSED_MESSAGE: &str = "Critical status dismissed as false alarm.";

struct StudentEntry {
    conn_id: u64,
    state: StudentState,
    commands: mpsc::Sender<StudentCommand>,
    close: CancellationToken,
}

/// Shared relay state.
pub struct RelayHub {
    audio_dir: PathBuf,
    removal_grace: Duration,
    workflow: ReviewWorkflow,
    analyzer: Arc<dyn EvidenceAnalyzer>,
    students: Mutex<HashMap<StudentId, StudentEntry>>,
    events: broadcast::Sender<RelayEvent>,
    next_conn: AtomicU64,
}

impl RelayHub {
    /// Build a hub from the relay and observer configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the critical status pattern is invalid.
    pub fn new(config: &GlobalConfig, analyzer: Arc<dyn EvidenceAnalyzer>) -> Result<Self> {
        let (events, _) = broadcast::channel(config.relay.observer_buffer);
        Ok(Self {
            audio_dir: config.relay.audio_dir.clone(),
            removal_grace: Duration::from_secs(config.relay.removal_grace_seconds),
            workflow: ReviewWorkflow::from_config(&config.observer)?,
            analyzer,
            students: Mutex::new(HashMap::new()),
            events,
            next_conn: AtomicU64::new(1),
        })
    }

    /// Directory flagged audio clips are written to.
    #[must_use]
    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    /// Register a student channel and announce it to observers.
    ///
    /// Returns the connection id that must accompany every later call for
    /// this channel.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] for a blank identity or one that is
    /// already connected; the existing channel keeps ownership.
    pub async fn register(
        &self,
        student_id: &StudentId,
        commands: mpsc::Sender<StudentCommand>,
        close: CancellationToken,
    ) -> Result<u64> {
        if student_id.is_blank() {
            return Err(AppError::Protocol("student identity must not be empty".into()));
        }

        let mut students = self.students.lock().await;
        if students.contains_key(student_id) {
            return Err(AppError::Protocol(format!(
                "student {student_id} is already connected"
            )));
        }

        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let state = StudentState::joined(student_id.clone());
        students.insert(
            student_id.clone(),
            StudentEntry {
                conn_id,
                state: state.clone(),
                commands,
                close,
            },
        );
        self.publish(RelayEvent::StudentJoined { student: state });
        info!(%student_id, conn_id, "student registered");
        Ok(conn_id)
    }

    /// Fold a periodic frame and offer it to the analyzer.
    pub async fn record_frame(&self, student_id: &StudentId, conn_id: u64, snapshot: Snapshot) {
        let current = {
            let mut students = self.students.lock().await;
            let Some(entry) = Self::entry_mut(&mut students, student_id, conn_id) else {
                return;
            };

            let mut patch = StudentPatch::new(student_id.clone()).with_latest_snapshot(snapshot.clone());
            if entry.state.baseline_snapshot.is_none() {
                debug!(%student_id, "baseline snapshot captured");
                patch = patch.with_baseline_snapshot(snapshot.clone());
            }
            if entry.state.apply(&patch) {
                self.publish(RelayEvent::StudentUpdated { patch });
            }
            entry.state.clone()
        };

        if let Some(verdict) = self.analyzer.analyze_frame(&current, &snapshot) {
            let evidence = Evidence {
                snapshot: Some(snapshot),
                audio_clip: None,
            };
            self.apply_verdict(student_id, conn_id, verdict, evidence).await;
        }
    }

    /// Offer a completed audio segment to the analyzer.
    ///
    /// The clip is written to disk only when the verdict raises an alert.
    pub async fn record_audio(
        &self,
        student_id: &StudentId,
        conn_id: u64,
        audio: Vec<u8>,
        snapshot: Option<Snapshot>,
    ) {
        let current = {
            let mut students = self.students.lock().await;
            let Some(entry) = Self::entry_mut(&mut students, student_id, conn_id) else {
                return;
            };
            entry.state.clone()
        };

        let Some(verdict) = self
            .analyzer
            .analyze_audio(&current, &audio, snapshot.as_ref())
        else {
            debug!(%student_id, bytes = audio.len(), "audio segment cleared");
            return;
        };

        let audio_clip = if verdict.alert.is_some() {
            match self.store_clip(student_id, &audio).await {
                Ok(clip) => Some(clip),
                Err(err) => {
                    warn!(%student_id, %err, "could not store flagged audio");
                    None
                }
            }
        } else {
            None
        };

        let evidence = Evidence {
            snapshot,
            audio_clip,
        };
        self.apply_verdict(student_id, conn_id, verdict, evidence).await;
    }

    /// Retract a student channel. Returns `false` if it was already gone.
    pub async fn depart(&self, student_id: &StudentId, conn_id: u64) -> bool {
        let mut students = self.students.lock().await;
        if Self::entry_mut(&mut students, student_id, conn_id).is_none() {
            return false;
        }
        students.remove(student_id);
        self.publish(RelayEvent::StudentLeft {
            student_id: student_id.clone(),
        });
        info!(%student_id, conn_id, "student departed");
        true
    }

    /// Forward a removal command and schedule a forced close.
    ///
    /// Returns `false` if the student is not connected.
    pub async fn remove_student(&self, student_id: &StudentId, reason: &str) -> bool {
        let students = self.students.lock().await;
        let Some(entry) = students.get(student_id) else {
            warn!(%student_id, "removal for unknown student ignored");
            return false;
        };

        let command = StudentCommand::Removal {
            reason: reason.to_owned(),
        };
        if let Err(err) = entry.commands.try_send(command) {
            warn!(%student_id, %err, "removal command not queued; channel will be closed");
        }
        self.publish(RelayEvent::Alert {
            alert: AlertEvent::new(student_id.clone(), Severity::Info, REMOVED_MESSAGE),
        });
        info!(%student_id, reason, "removal forwarded");

        let close = entry.close.clone();
        let grace = self.removal_grace;
        let student_id = student_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = close.cancelled() => {}
                () = tokio::time::sleep(grace) => {
                    info!(%student_id, "removal grace elapsed, closing channel");
                    close.cancel();
                }
            }
        });
        true
    }

    /// Reset a critical status to the dismissed label.
    ///
    /// Returns `false` if the student is unknown or not in a critical status.
    pub async fn dismiss_alert(&self, student_id: &StudentId) -> bool {
        let mut students = self.students.lock().await;
        let Some(entry) = students.get_mut(student_id) else {
            debug!(%student_id, "dismiss for unknown student ignored");
            return false;
        };
        if !self.workflow.is_critical(&entry.state.status) {
            debug!(%student_id, status = entry.state.status, "dismiss for non-critical status ignored");
            return false;
        }

        let patch = StudentPatch::new(student_id.clone()).with_status(self.workflow.dismissed_label());
        entry.state.apply(&patch);
        self.publish(RelayEvent::StudentUpdated { patch });
        self.publish(RelayEvent::Alert {
            alert: AlertEvent::new(student_id.clone(), Severity::Info, DISMISSED_MESSAGE),
        });
        info!(%student_id, "critical status dismissed");
        true
    }

    /// Current roster plus a subscription starting right after it.
    pub async fn observe(&self) -> (Vec<StudentState>, broadcast::Receiver<RelayEvent>) {
        let students = self.students.lock().await;
        let rx = self.events.subscribe();
        let mut roster: Vec<StudentState> = students.values().map(|e| e.state.clone()).collect();
        roster.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        (roster, rx)
    }

    /// Current roster.
    pub async fn roster(&self) -> Vec<StudentState> {
        self.observe().await.0
    }

    async fn apply_verdict(
        &self,
        student_id: &StudentId,
        conn_id: u64,
        verdict: Verdict,
        evidence: Evidence,
    ) {
        let mut students = self.students.lock().await;
        let Some(entry) = Self::entry_mut(&mut students, student_id, conn_id) else {
            return;
        };

        let mut patch = StudentPatch::new(student_id.clone());
        patch.focus_score = verdict.focus_score;
        patch.status = verdict.status;
        if verdict.add_warnings > 0 {
            patch.warning_count = Some(entry.state.warning_count.saturating_add(verdict.add_warnings));
        }
        if !patch.is_empty() && entry.state.apply(&patch) {
            self.publish(RelayEvent::StudentUpdated { patch });
        }

        if let Some(alert) = verdict.alert {
            let alert = AlertEvent::new(student_id.clone(), alert.severity, alert.message)
                .with_evidence(evidence);
            info!(%student_id, alert_id = alert.alert_id, severity = ?alert.severity, "alert raised");
            self.publish(RelayEvent::Alert { alert });
        }
    }

    async fn store_clip(&self, student_id: &StudentId, audio: &[u8]) -> Result<AudioClipRef> {
        tokio::fs::create_dir_all(&self.audio_dir).await?;
        let uuid = Uuid::new_v4().simple().to_string();
        let filename = format!(
            "{}_{}_{}.webm",
            student_id.file_safe(),
            Utc::now().format("%Y%m%d_%H%M%S"),
            &uuid[..8]
        );
        tokio::fs::write(self.audio_dir.join(&filename), audio).await?;
        info!(%student_id, filename, "flagged audio stored");
        Ok(AudioClipRef { filename })
    }

    fn entry_mut<'a>(
        students: &'a mut HashMap<StudentId, StudentEntry>,
        student_id: &StudentId,
        conn_id: u64,
    ) -> Option<&'a mut StudentEntry> {
        students
            .get_mut(student_id)
            .filter(|entry| entry.conn_id == conn_id)
    }

    fn publish(&self, event: RelayEvent) {
        // No observer attached is fine.
        let _ = self.events.send(event);
    }
}
