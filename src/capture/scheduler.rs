//! Student-side capture cadence.
//!
//! One [`CaptureScheduler`] runs per session. It owns the devices through a
//! [`DeviceGuard`] and drives two independent timers from a single loop:
//!
//! - every `snapshot_interval` it captures a still frame and emits
//!   [`StudentMessage::Frame`];
//! - every `audio_segment` it flushes the recorder (which keeps recording)
//!   and emits [`StudentMessage::AudioSegment`] with a boundary snapshot.
//!
//! The loop ends on cancellation, when the outbound channel closes, or on a
//! device failure. The guard is dropped on every one of those paths, so the
//! devices are always released when the task ends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::capture::device::DeviceGuard;
use crate::config::CaptureConfig;
use crate::models::student::{Snapshot, StudentId};
use crate::protocol::messages::StudentMessage;
use crate::{AppError, Result};

/// Counters published by a running scheduler.
#[derive(Debug, Default)]
struct CaptureCounters {
    frames_sent: AtomicU64,
    segments_sent: AtomicU64,
    frames_dropped: AtomicU64,
    segments_dropped: AtomicU64,
}

/// Point-in-time copy of a scheduler's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// `frame` messages handed to the channel.
    pub frames_sent: u64,
    /// `audio_segment` messages handed to the channel.
    pub segments_sent: u64,
    /// Frames lost to encode failures.
    pub frames_dropped: u64,
    /// Audio segments lost to encode failures.
    pub segments_dropped: u64,
}

impl CaptureCounters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            segments_sent: self.segments_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            segments_dropped: self.segments_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Why a scheduler loop stopped without a device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Cancelled,
    ChannelClosed,
}

/// Builder for a per-session capture scheduler.
///
/// Call [`spawn`](Self::spawn) to start the capture task.
pub struct CaptureScheduler {
    student_id: StudentId,
    snapshot_interval: Duration,
    segment_length: Duration,
    event_tx: mpsc::Sender<StudentMessage>,
    cancel: CancellationToken,
}

impl CaptureScheduler {
    /// Construct a scheduler (does not start capturing yet).
    #[must_use]
    pub fn new(
        student_id: StudentId,
        config: &CaptureConfig,
        event_tx: mpsc::Sender<StudentMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            student_id,
            snapshot_interval: config.snapshot_interval(),
            segment_length: config.audio_segment(),
            event_tx,
            cancel,
        }
    }

    /// Move `devices` into a background capture task and return its handle.
    #[must_use]
    pub fn spawn(self, devices: DeviceGuard) -> CaptureHandle {
        let counters = Arc::new(CaptureCounters::default());
        let cancel_for_handle = self.cancel.clone();
        let span = info_span!("capture", student_id = %self.student_id);

        let task = tokio::spawn(
            Self::run(
                self.snapshot_interval,
                self.segment_length,
                self.event_tx,
                self.cancel,
                devices,
                Arc::clone(&counters),
            )
            .instrument(span),
        );

        CaptureHandle {
            counters,
            join_handle: Some(task),
            cancel: cancel_for_handle,
        }
    }

    /// Core capture loop.
    async fn run(
        snapshot_interval: Duration,
        segment_length: Duration,
        event_tx: mpsc::Sender<StudentMessage>,
        cancel: CancellationToken,
        mut devices: DeviceGuard,
        counters: Arc<CaptureCounters>,
    ) -> Result<()> {
        let outcome = Self::capture_loop(
            snapshot_interval,
            segment_length,
            &event_tx,
            &cancel,
            &mut devices,
            &counters,
        )
        .await;

        devices.release();
        let stats = counters.snapshot();

        match outcome {
            Ok(Halt::Cancelled) => {
                info!(?stats, "capture stopped: session cancelled");
                Ok(())
            }
            Ok(Halt::ChannelClosed) => {
                info!(?stats, "capture stopped: outbound channel closed");
                Ok(())
            }
            Err(err) => {
                warn!(%err, ?stats, "capture stopped: device failure");
                Err(err)
            }
        }
    }

    async fn capture_loop(
        snapshot_interval: Duration,
        segment_length: Duration,
        event_tx: &mpsc::Sender<StudentMessage>,
        cancel: &CancellationToken,
        devices: &mut DeviceGuard,
        counters: &CaptureCounters,
    ) -> Result<Halt> {
        devices
            .audio()
            .ok_or_else(|| AppError::Device("microphone released before start".into()))?
            .start()?;
        info!(?snapshot_interval, ?segment_length, "capture started");

        let start = Instant::now();
        let mut snapshots = interval_at(start + snapshot_interval, snapshot_interval);
        let mut segments = interval_at(start + segment_length, segment_length);
        snapshots.set_missed_tick_behavior(MissedTickBehavior::Delay);
        segments.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let msg = tokio::select! {
                biased;

                () = cancel.cancelled() => return Ok(Halt::Cancelled),

                _ = segments.tick() => {
                    match Self::flush_segment(devices, counters)? {
                        Some(msg) => msg,
                        None => continue,
                    }
                }

                _ = snapshots.tick() => {
                    match Self::take_snapshot(devices, counters)? {
                        Some(snapshot) => StudentMessage::Frame { snapshot },
                        None => continue,
                    }
                }
            };

            let is_segment = matches!(msg, StudentMessage::AudioSegment { .. });
            if let Some(halt) = Self::emit(event_tx, cancel, msg).await {
                return Ok(halt);
            }
            if is_segment {
                counters.segments_sent.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Capture one frame; `Ok(None)` when this frame failed to encode.
    fn take_snapshot(
        devices: &mut DeviceGuard,
        counters: &CaptureCounters,
    ) -> Result<Option<Snapshot>> {
        let video = devices
            .video()
            .ok_or_else(|| AppError::Device("camera released".into()))?;
        match video.snapshot() {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(err) if !err.is_fatal_to_capture() => {
                counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%err, "frame dropped");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Flush the recorder and pair the segment with a boundary snapshot.
    fn flush_segment(
        devices: &mut DeviceGuard,
        counters: &CaptureCounters,
    ) -> Result<Option<StudentMessage>> {
        let audio = devices
            .audio()
            .ok_or_else(|| AppError::Device("microphone released".into()))?;
        let audio = match audio.flush_segment() {
            Ok(bytes) => bytes,
            Err(err) if !err.is_fatal_to_capture() => {
                counters.segments_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%err, "audio segment dropped");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let snapshot = Self::take_snapshot(devices, counters)?;
        Ok(Some(StudentMessage::AudioSegment { audio, snapshot }))
    }

    /// Hand `msg` to the channel unless the session is already closing.
    async fn emit(
        event_tx: &mpsc::Sender<StudentMessage>,
        cancel: &CancellationToken,
        msg: StudentMessage,
    ) -> Option<Halt> {
        tokio::select! {
            biased;

            () = cancel.cancelled() => Some(Halt::Cancelled),

            sent = event_tx.send(msg) => {
                if sent.is_err() {
                    Some(Halt::ChannelClosed)
                } else {
                    None
                }
            }
        }
    }
}

/// Handle returned from [`CaptureScheduler::spawn`].
///
/// Dropping the handle cancels the capture task.
pub struct CaptureHandle {
    counters: Arc<CaptureCounters>,
    join_handle: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl CaptureHandle {
    /// Counters as of now.
    #[must_use]
    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    /// Wait for the capture task to end on its own.
    ///
    /// Returns immediately with `Ok(())` once the task has already been
    /// awaited.
    ///
    /// # Errors
    ///
    /// Returns the task's [`AppError::Device`] failure, or
    /// [`AppError::Device`] if the task panicked.
    pub async fn finished(&mut self) -> Result<()> {
        let Some(handle) = self.join_handle.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        self.join_handle = None;
        joined.map_err(|e| AppError::Device(format!("capture task aborted: {e}")))?
    }

    /// Cancel capture and wait until the devices have been released.
    pub async fn stop(mut self) -> CaptureStats {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            if let Ok(Err(err)) = handle.await {
                debug!(%err, "capture ended with error before stop");
            }
        }
        self.counters.snapshot()
    }
}
