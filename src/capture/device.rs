//! Capture device seams and scoped device ownership.
//!
//! The platform camera and microphone live behind [`VideoSource`] and
//! [`AudioSource`]. A [`CaptureDevices`] factory opens both at once and
//! hands them out inside a [`DeviceGuard`], which releases them exactly
//! once when dropped, whatever path the session took to end.

use tracing::{debug, info};

use crate::models::student::{Snapshot, StudentId};
use crate::Result;

/// Live video source.
pub trait VideoSource: Send {
    /// Capture one still frame and encode it as JPEG.
    ///
    /// # Errors
    ///
    /// - [`AppError::Encode`](crate::AppError::Encode): this frame could not
    ///   be encoded; the caller drops it and carries on.
    /// - [`AppError::Device`](crate::AppError::Device): the camera is gone.
    fn snapshot(&mut self) -> Result<Snapshot>;

    /// Release the camera handle.
    fn release(&mut self);
}

/// Continuously recording microphone.
pub trait AudioSource: Send {
    /// Start buffering microphone input.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Device`](crate::AppError::Device) if the
    /// microphone cannot be started.
    fn start(&mut self) -> Result<()>;

    /// Encode everything buffered since the previous flush and keep
    /// recording into a fresh buffer without any gap.
    ///
    /// # Errors
    ///
    /// - [`AppError::Encode`](crate::AppError::Encode): this segment is lost;
    ///   recording continues.
    /// - [`AppError::Device`](crate::AppError::Device): the microphone is gone.
    fn flush_segment(&mut self) -> Result<Vec<u8>>;

    /// Release the microphone handle.
    fn release(&mut self);
}

/// Opened camera and microphone.
pub struct DeviceSet {
    /// Camera.
    pub video: Box<dyn VideoSource>,
    /// Microphone.
    pub audio: Box<dyn AudioSource>,
}

/// Opens the capture devices for one session.
pub trait CaptureDevices: Send + Sync {
    /// Acquire the camera and microphone.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Device`](crate::AppError::Device) if either
    /// device is unavailable or access is denied.
    fn open(&self) -> Result<DeviceSet>;
}

/// Scoped ownership of an opened [`DeviceSet`].
///
/// Dropping the guard releases both devices. Release happens once even if
/// [`release`](Self::release) was already called explicitly.
pub struct DeviceGuard {
    student_id: StudentId,
    devices: Option<DeviceSet>,
}

impl DeviceGuard {
    /// Open the devices through `factory` and take ownership of them.
    ///
    /// # Errors
    ///
    /// Propagates the factory's [`AppError::Device`](crate::AppError::Device).
    pub fn acquire(student_id: StudentId, factory: &dyn CaptureDevices) -> Result<Self> {
        let devices = factory.open()?;
        info!(%student_id, "capture devices acquired");
        Ok(Self {
            student_id,
            devices: Some(devices),
        })
    }

    /// Camera, while the guard still holds it.
    pub fn video(&mut self) -> Option<&mut (dyn VideoSource + 'static)> {
        self.devices.as_mut().map(|d| d.video.as_mut())
    }

    /// Microphone, while the guard still holds it.
    pub fn audio(&mut self) -> Option<&mut (dyn AudioSource + 'static)> {
        self.devices.as_mut().map(|d| d.audio.as_mut())
    }

    /// Release both devices now.
    pub fn release(&mut self) {
        if let Some(mut devices) = self.devices.take() {
            devices.video.release();
            devices.audio.release();
            info!(student_id = %self.student_id, "capture devices released");
        } else {
            debug!(student_id = %self.student_id, "capture devices already released");
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.release();
    }
}
