use lockin_proctor::capture::synthetic::{SyntheticControls, SyntheticDevices};
use lockin_proctor::capture::DeviceGuard;
use lockin_proctor::AppError;

#[test]
fn guard_releases_both_devices_on_drop() {
    let controls = SyntheticControls::new();
    let devices = SyntheticDevices::new(controls.clone());

    {
        let _guard = DeviceGuard::acquire("s1".into(), &devices).expect("open");
        assert_eq!(controls.opened_sets(), 1);
        assert_eq!(controls.released_handles(), 0);
    }
    assert_eq!(controls.released_handles(), 2);
}

#[test]
fn explicit_release_is_idempotent() {
    let controls = SyntheticControls::new();
    let devices = SyntheticDevices::new(controls.clone());

    let mut guard = DeviceGuard::acquire("s1".into(), &devices).expect("open");
    guard.release();
    guard.release();
    assert!(guard.video().is_none());
    assert!(guard.audio().is_none());
    drop(guard);
    assert_eq!(controls.released_handles(), 2);
}

#[test]
fn denied_access_fails_before_anything_is_held() {
    let controls = SyntheticControls::new();
    controls.deny_access();
    let devices = SyntheticDevices::new(controls.clone());

    let err = DeviceGuard::acquire("s1".into(), &devices)
        .err()
        .expect("access denied");
    assert!(matches!(err, AppError::Device(_)), "got {err:?}");
    assert_eq!(controls.opened_sets(), 0);
    assert_eq!(controls.released_handles(), 0);
}

#[test]
fn corrupted_frame_is_an_encode_error_and_next_frame_succeeds() {
    let controls = SyntheticControls::new();
    controls.corrupt_next_frames(1);
    let devices = SyntheticDevices::new(controls.clone());
    let mut guard = DeviceGuard::acquire("s1".into(), &devices).expect("open");

    let camera = guard.video().expect("held");
    let err = camera.snapshot().unwrap_err();
    assert!(matches!(err, AppError::Encode(_)), "got {err:?}");
    assert!(!err.is_fatal_to_capture());

    let frame = camera.snapshot().expect("second frame encodes");
    assert_eq!(&frame.as_bytes()[..2], &[0xFF, 0xD8]);
}
