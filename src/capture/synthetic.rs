//! Synthetic camera and microphone.
//!
//! Stand-ins for platform devices, used by `lockin-ctl simulate-student`
//! and the test suite. A shared [`SyntheticControls`] lets the caller
//! inject access denial, encode failures, and device loss, and observe how
//! many handles were opened and released.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use crate::capture::device::{AudioSource, CaptureDevices, DeviceSet, VideoSource};
use crate::models::student::Snapshot;
use crate::{AppError, Result};

const JPEG_SOI: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Fault injection and bookkeeping shared by every synthetic device.
#[derive(Debug, Default)]
pub struct SyntheticControls {
    deny_access: AtomicBool,
    unplugged: AtomicBool,
    corrupt_frames: AtomicU32,
    corrupt_segments: AtomicU32,
    opened_sets: AtomicU32,
    released_handles: AtomicU32,
    frames_captured: AtomicU64,
}

impl SyntheticControls {
    /// Fresh controls with no faults armed.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next [`CaptureDevices::open`] fail as if permission was refused.
    pub fn deny_access(&self) {
        self.deny_access.store(true, Ordering::SeqCst);
    }

    /// Make every later capture report the device as gone.
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }

    /// Fail to encode the next `n` frames.
    pub fn corrupt_next_frames(&self, n: u32) {
        self.corrupt_frames.store(n, Ordering::SeqCst);
    }

    /// Fail to encode the next `n` audio segments.
    pub fn corrupt_next_segments(&self, n: u32) {
        self.corrupt_segments.store(n, Ordering::SeqCst);
    }

    /// Device sets opened so far.
    #[must_use]
    pub fn opened_sets(&self) -> u32 {
        self.opened_sets.load(Ordering::SeqCst)
    }

    /// Individual device handles released so far (two per set).
    #[must_use]
    pub fn released_handles(&self) -> u32 {
        self.released_handles.load(Ordering::SeqCst)
    }

    fn check_present(&self, what: &str) -> Result<()> {
        if self.unplugged.load(Ordering::SeqCst) {
            return Err(AppError::Device(format!("{what} disconnected")));
        }
        Ok(())
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// [`CaptureDevices`] factory producing synthetic devices.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    controls: Arc<SyntheticControls>,
}

impl SyntheticDevices {
    /// Factory bound to `controls`.
    #[must_use]
    pub fn new(controls: Arc<SyntheticControls>) -> Self {
        Self { controls }
    }
}

impl CaptureDevices for SyntheticDevices {
    fn open(&self) -> Result<DeviceSet> {
        if self.controls.deny_access.load(Ordering::SeqCst) {
            return Err(AppError::Device(
                "camera/microphone access denied".into(),
            ));
        }
        self.controls.check_present("camera")?;
        self.controls.opened_sets.fetch_add(1, Ordering::SeqCst);

        Ok(DeviceSet {
            video: Box::new(SyntheticCamera {
                controls: Arc::clone(&self.controls),
            }),
            audio: Box::new(SyntheticMicrophone {
                controls: Arc::clone(&self.controls),
                segment_started: None,
            }),
        })
    }
}

struct SyntheticCamera {
    controls: Arc<SyntheticControls>,
}

impl VideoSource for SyntheticCamera {
    fn snapshot(&mut self) -> Result<Snapshot> {
        self.controls.check_present("camera")?;
        if SyntheticControls::take_fault(&self.controls.corrupt_frames) {
            return Err(AppError::Encode("jpeg encoder rejected frame".into()));
        }
        let seq = self.controls.frames_captured.fetch_add(1, Ordering::SeqCst);

        let mut bytes = Vec::with_capacity(JPEG_SOI.len() + 8 + JPEG_EOI.len());
        bytes.extend_from_slice(&JPEG_SOI);
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes.extend_from_slice(&JPEG_EOI);
        Ok(Snapshot::new(bytes))
    }

    fn release(&mut self) {
        self.controls.released_handles.fetch_add(1, Ordering::SeqCst);
    }
}

struct SyntheticMicrophone {
    controls: Arc<SyntheticControls>,
    segment_started: Option<Instant>,
}

impl AudioSource for SyntheticMicrophone {
    fn start(&mut self) -> Result<()> {
        self.controls.check_present("microphone")?;
        self.segment_started = Some(Instant::now());
        Ok(())
    }

    fn flush_segment(&mut self) -> Result<Vec<u8>> {
        self.controls.check_present("microphone")?;
        let Some(started) = self.segment_started.replace(Instant::now()) else {
            return Err(AppError::Device("microphone not started".into()));
        };
        if SyntheticControls::take_fault(&self.controls.corrupt_segments) {
            return Err(AppError::Encode("audio encoder flush failed".into()));
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut bytes = Vec::with_capacity(EBML_MAGIC.len() + 8);
        bytes.extend_from_slice(&EBML_MAGIC);
        bytes.extend_from_slice(&elapsed_ms.to_be_bytes());
        Ok(bytes)
    }

    fn release(&mut self) {
        self.segment_started = None;
        self.controls.released_handles.fetch_add(1, Ordering::SeqCst);
    }
}
