use std::fmt;

use thiserror::Error;

use super::permission::{DeviceType, PermissionStatus};

/// Step of the transactional session setup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    ResolveDevice,
    CreateTap,
    CreateAggregateDevice,
    QueryFormat,
    CreateConverter,
    RegisterIoProc,
    StartDevice,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResolveDevice => "resolve device",
            Self::CreateTap => "create tap",
            Self::CreateAggregateDevice => "create aggregate device",
            Self::QueryFormat => "query stream format",
            Self::CreateConverter => "create converter",
            Self::RegisterIoProc => "register IOProc",
            Self::StartDevice => "start device",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during audio capture operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("{device} permission not authorized (status: {status})")]
    PermissionDenied {
        device: DeviceType,
        status: PermissionStatus,
    },

    #[error("setup failed at {step}: {message}")]
    SetupFailed { step: SetupStep, message: String },

    #[error("unsupported format: {0}")]
    FormatUnsupported(String),

    #[error("no {0} device available")]
    DeviceNotAvailable(DeviceType),

    #[error("capture setup already in progress")]
    Busy,

    #[error("capture device {device_uid} disappeared")]
    TopologyLost { device_uid: String },

    #[error("privileged API unavailable: {0}")]
    SymbolResolution(String),

    #[error("{operation} failed: OSStatus {status}")]
    OsStatus { operation: String, status: i32 },

    #[error("audio queue is not running")]
    QueueUnavailable,

    #[error("timeout")]
    Timeout,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CaptureError {
    pub fn os(operation: impl Into<String>, status: i32) -> Self {
        Self::OsStatus {
            operation: operation.into(),
            status,
        }
    }

    /// Stable identifier surfaced to the host alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::SetupFailed { .. } => "SETUP_FAILED",
            Self::FormatUnsupported(_) => "FORMAT_UNSUPPORTED",
            Self::DeviceNotAvailable(_) => "DEVICE_NOT_AVAILABLE",
            Self::Busy => "BUSY",
            Self::TopologyLost { .. } => "TOPOLOGY_LOST",
            Self::SymbolResolution(_) => "SYMBOL_RESOLUTION",
            Self::OsStatus { .. } => "OS_STATUS",
            Self::QueueUnavailable => "QUEUE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Wrap a backend failure as a setup error for `step`.
    ///
    /// Permission, format and device-availability errors keep their own
    /// variant so the host can react to them specifically.
    pub fn at_step(self, step: SetupStep) -> Self {
        match self {
            Self::PermissionDenied { .. }
            | Self::FormatUnsupported(_)
            | Self::DeviceNotAvailable(_)
            | Self::SetupFailed { .. } => self,
            other => Self::SetupFailed {
                step,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CaptureError::Busy.code(), "BUSY");
        assert_eq!(
            CaptureError::TopologyLost {
                device_uid: "x".into()
            }
            .code(),
            "TOPOLOGY_LOST"
        );
        assert_eq!(CaptureError::os("AudioDeviceStart", -50).code(), "OS_STATUS");
    }

    #[test]
    fn at_step_wraps_os_errors_only() {
        let wrapped = CaptureError::os("AudioHardwareCreateAggregateDevice", 1852797029)
            .at_step(SetupStep::CreateAggregateDevice);
        assert_eq!(
            wrapped,
            CaptureError::SetupFailed {
                step: SetupStep::CreateAggregateDevice,
                message: "AudioHardwareCreateAggregateDevice failed: OSStatus 1852797029".into(),
            }
        );

        let denied = CaptureError::PermissionDenied {
            device: DeviceType::SystemAudio,
            status: PermissionStatus::Denied,
        };
        assert_eq!(denied.clone().at_step(SetupStep::CreateTap), denied);
    }

    #[test]
    fn messages_are_readable() {
        let err = CaptureError::PermissionDenied {
            device: DeviceType::SystemAudio,
            status: PermissionStatus::NotDetermined,
        };
        assert_eq!(err.to_string(), "audio permission not authorized (status: not_determined)");
    }
}
