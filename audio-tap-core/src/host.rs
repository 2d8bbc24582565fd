//! Host-facing surface: the `AudioWrapper` object a runtime binding exposes,
//! and the serialisable result types it returns.

use std::sync::Arc;

use serde::Serialize;

use crate::models::error::CaptureError;
use crate::models::permission::{DeviceType, PermissionMap};
use crate::session::manager::AudioManager;
use crate::traits::capture_backend::CaptureBackend;

/// Error as seen by the host: stable code plus readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostError {
    pub code: String,
    pub message: String,
}

impl From<&CaptureError> for HostError {
    fn from(error: &CaptureError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Outcome of a host call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HostError>,
}

impl HostResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"success":false,"error":{{"code":"UNKNOWN","message":"{}"}}}}"#, e)
        })
    }
}

impl From<Result<(), CaptureError>> for HostResult {
    fn from(result: Result<(), CaptureError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self {
                success: false,
                error: Some(HostError::from(&e)),
            },
        }
    }
}

/// What a runtime binding hands to the host as its audio object.
pub struct AudioWrapper<B: CaptureBackend> {
    manager: Arc<AudioManager<B>>,
}

impl<B: CaptureBackend> AudioWrapper<B> {
    pub fn new(manager: Arc<AudioManager<B>>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<AudioManager<B>> {
        &self.manager
    }

    /// Register `callback` as the data consumer, then start capture.
    pub fn start_capture<F>(&self, callback: F) -> HostResult
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.manager.set_audio_data_callback(Some(Arc::new(callback)));
        let result = self.manager.start_capture();
        if let Err(e) = &result {
            log::error!("startCapture failed: {}", e);
        }
        result.into()
    }

    pub fn stop_capture(&self) -> HostResult {
        let result = self.manager.stop_capture();
        if let Err(e) = &result {
            log::error!("stopCapture failed: {}", e);
        }
        result.into()
    }

    pub fn get_permissions(&self) -> PermissionMap {
        self.manager.get_permissions()
    }

    pub fn permissions_json(&self) -> Result<String, CaptureError> {
        serde_json::to_string(&self.get_permissions())
            .map_err(|e| CaptureError::Unknown(format!("failed to encode permissions: {}", e)))
    }

    /// `device` is the host's device string (`microphone` or `audio`).
    /// Unknown strings complete immediately with an error.
    pub fn request_permissions<F>(&self, device: &str, completion: F)
    where
        F: FnOnce(Result<PermissionMap, HostError>) + Send + 'static,
    {
        let Some(device_type) = DeviceType::from_host_str(device) else {
            log::warn!("requestPermissions: unknown device type {:?}", device);
            completion(Err(HostError {
                code: "INVALID_DEVICE_TYPE".into(),
                message: format!("unknown device type: {}", device),
            }));
            return;
        };
        self.manager
            .request_permissions(device_type, move |permissions| completion(Ok(permissions)));
    }
}
