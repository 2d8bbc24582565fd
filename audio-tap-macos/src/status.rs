use audio_tap_core::models::error::CaptureError;
use audio_tap_core::models::permission::{DeviceType, PermissionStatus};

/// `kAudioDevicePermissionsError` ('!hog').
pub const PERMISSIONS_ERROR: i32 = 0x2168_6F67;

/// Render an OSStatus as its four-character code when printable.
pub fn fourcc(status: i32) -> String {
    let bytes = status.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        format!("'{}'", String::from_utf8_lossy(&bytes))
    } else {
        status.to_string()
    }
}

/// Map a CoreAudio status to `Ok` or a `CaptureError`.
pub fn check(operation: &str, status: i32, device_type: DeviceType) -> Result<(), CaptureError> {
    match status {
        0 => Ok(()),
        PERMISSIONS_ERROR => {
            log::warn!("{} refused: {} permission missing", operation, device_type);
            Err(CaptureError::PermissionDenied {
                device: device_type,
                status: PermissionStatus::Denied,
            })
        }
        _ => {
            log::warn!("{} failed with {}", operation, fourcc(status));
            Err(CaptureError::os(operation, status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_renders_codes() {
        assert_eq!(fourcc(PERMISSIONS_ERROR), "'!hog'");
        assert_eq!(fourcc(0x7768_6F3F), "'who?'");
        assert_eq!(fourcc(-50), "-50");
    }

    #[test]
    fn check_maps_permission_error() {
        assert_eq!(check("AudioDeviceStart", 0, DeviceType::SystemAudio), Ok(()));
        assert!(matches!(
            check("AudioHardwareCreateProcessTap", PERMISSIONS_ERROR, DeviceType::SystemAudio),
            Err(CaptureError::PermissionDenied { .. })
        ));
        assert_eq!(
            check("AudioDeviceStart", -50, DeviceType::Microphone),
            Err(CaptureError::os("AudioDeviceStart", -50))
        );
    }
}
