//! Unit tests for the capture scheduler.
//!
//! Runs on a paused clock so cadence assertions are exact: the runtime
//! advances virtual time to the next timer whenever every task is idle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lockin_proctor::capture::synthetic::{SyntheticControls, SyntheticDevices};
use lockin_proctor::capture::{CaptureHandle, CaptureScheduler, DeviceGuard};
use lockin_proctor::config::CaptureConfig;
use lockin_proctor::protocol::messages::StudentMessage;
use lockin_proctor::AppError;

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

fn start(
    controls: &Arc<SyntheticControls>,
) -> (CaptureHandle, mpsc::Receiver<StudentMessage>, CancellationToken) {
    let config = CaptureConfig {
        snapshot_interval_ms: 2000,
        audio_segment_seconds: 10,
    };
    let devices = SyntheticDevices::new(Arc::clone(controls));
    let guard = DeviceGuard::acquire("s1".into(), &devices).expect("devices open");
    let (tx, rx) = mpsc::channel(64);
    let ct = CancellationToken::new();
    let handle = CaptureScheduler::new("s1".into(), &config, tx, ct.clone()).spawn(guard);
    (handle, rx, ct)
}

fn drain(rx: &mut mpsc::Receiver<StudentMessage>) -> (Vec<StudentMessage>, Vec<StudentMessage>) {
    let mut frames = Vec::new();
    let mut segments = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        match msg {
            StudentMessage::Frame { .. } => frames.push(msg),
            StudentMessage::AudioSegment { .. } => segments.push(msg),
            other => panic!("unexpected message from scheduler: {other:?}"),
        }
    }
    (frames, segments)
}

#[tokio::test(start_paused = true)]
async fn cadence_over_twenty_one_seconds() {
    let controls = SyntheticControls::new();
    let (handle, mut rx, _ct) = start(&controls);

    tokio::time::sleep(Duration::from_millis(21_000)).await;
    let stats = handle.stop().await;

    let (frames, segments) = drain(&mut rx);
    assert_eq!(frames.len(), 10, "one frame every 2s");
    assert_eq!(segments.len(), 2, "one segment every 10s");
    assert_eq!(stats.frames_sent, 10);
    assert_eq!(stats.segments_sent, 2);

    for segment in &segments {
        let StudentMessage::AudioSegment { audio, snapshot } = segment else {
            unreachable!();
        };
        assert_eq!(&audio[..4], &EBML_MAGIC, "each segment is a complete container");
        assert!(snapshot.is_some(), "boundary snapshot attached");
    }
}

#[tokio::test(start_paused = true)]
async fn twenty_two_seconds_yield_two_segments_and_steady_frames() {
    let controls = SyntheticControls::new();
    let (handle, mut rx, _ct) = start(&controls);
    let mut segments = 0;

    // Windows (1s, 3s], (3s, 5s], ... each hold exactly one frame tick.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    for window in 0..10 {
        tokio::time::sleep(Duration::from_millis(2000)).await;
        let (frames, segs) = drain(&mut rx);
        assert_eq!(frames.len(), 1, "window {window} kept the 2s cadence");
        segments += segs.len();
    }
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let stats = handle.stop().await;
    segments += drain(&mut rx).1.len();

    assert_eq!(segments, 2);
    assert_eq!(stats.segments_sent, 2);
    assert_eq!(stats.segments_dropped, 0);
    assert!(stats.frames_sent >= 10);
}

#[tokio::test(start_paused = true)]
async fn stop_releases_devices_before_returning() {
    let controls = SyntheticControls::new();
    let (handle, _rx, _ct) = start(&controls);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    handle.stop().await;
    assert_eq!(controls.released_handles(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_session_token_stops_capture() {
    let controls = SyntheticControls::new();
    let (mut handle, _rx, ct) = start(&controls);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    ct.cancel();
    handle.finished().await.expect("clean stop");
    assert_eq!(controls.released_handles(), 2);
}

#[tokio::test(start_paused = true)]
async fn frame_encode_failure_drops_only_that_frame() {
    let controls = SyntheticControls::new();
    controls.corrupt_next_frames(1);
    let (handle, mut rx, _ct) = start(&controls);

    tokio::time::sleep(Duration::from_millis(5000)).await;
    let stats = handle.stop().await;

    let (frames, _) = drain(&mut rx);
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(frames.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn segment_encode_failure_drops_only_that_segment() {
    let controls = SyntheticControls::new();
    controls.corrupt_next_segments(1);
    let (handle, mut rx, _ct) = start(&controls);

    tokio::time::sleep(Duration::from_millis(21_000)).await;
    let stats = handle.stop().await;

    let (frames, segments) = drain(&mut rx);
    assert_eq!(stats.segments_dropped, 1);
    assert_eq!(segments.len(), 1);
    assert_eq!(frames.len(), 10, "frames keep flowing");
}

#[tokio::test(start_paused = true)]
async fn device_loss_is_fatal_and_releases_devices() {
    let controls = SyntheticControls::new();
    let (mut handle, mut rx, _ct) = start(&controls);

    tokio::time::sleep(Duration::from_millis(3000)).await;
    controls.unplug();

    let err = handle.finished().await.unwrap_err();
    assert!(matches!(err, AppError::Device(_)), "got {err:?}");
    assert_eq!(controls.released_handles(), 2);

    let (frames, _) = drain(&mut rx);
    assert_eq!(frames.len(), 1, "only the frame before the loss");
}

#[tokio::test(start_paused = true)]
async fn microphone_failure_at_start_is_fatal() {
    let controls = SyntheticControls::new();
    let devices = SyntheticDevices::new(Arc::clone(&controls));
    let guard = DeviceGuard::acquire("s1".into(), &devices).expect("devices open");
    controls.unplug();

    let (tx, _rx) = mpsc::channel(8);
    let mut handle = CaptureScheduler::new(
        "s1".into(),
        &CaptureConfig::default(),
        tx,
        CancellationToken::new(),
    )
    .spawn(guard);

    assert!(handle.finished().await.is_err());
    assert_eq!(controls.released_handles(), 2);
}

#[tokio::test(start_paused = true)]
async fn closed_channel_ends_capture_cleanly() {
    let controls = SyntheticControls::new();
    let (mut handle, rx, _ct) = start(&controls);
    drop(rx);

    handle.finished().await.expect("closed channel is not a device failure");
    assert_eq!(controls.released_handles(), 2);
    assert_eq!(handle.stats().frames_sent, 0);
}
