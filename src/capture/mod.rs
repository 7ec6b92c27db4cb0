//! Student-side evidence capture.

pub mod device;
pub mod scheduler;
pub mod synthetic;

pub use device::{AudioSource, CaptureDevices, DeviceGuard, DeviceSet, VideoSource};
pub use scheduler::{CaptureHandle, CaptureScheduler, CaptureStats};
