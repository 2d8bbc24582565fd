use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::models::error::CaptureError;
use crate::models::permission::{DeviceType, PermissionMap, PermissionStatus};
use crate::traits::consent_checker::{ConsentChecker, ConsentCompletion, ConsentSlot};

/// Queries and triggers OS consent for microphone and system-audio capture.
///
/// Status is always read fresh from the checker, never cached.
#[derive(Clone)]
pub struct PermissionGateway {
    checker: Arc<dyn ConsentChecker>,
    timeout: Duration,
}

impl PermissionGateway {
    pub fn new(checker: Arc<dyn ConsentChecker>, timeout: Duration) -> Self {
        Self { checker, timeout }
    }

    /// Current consent state. Checker failures read as `NotDetermined`,
    /// never as `Authorized`.
    pub fn status(&self, device: DeviceType) -> PermissionStatus {
        match self.checker.preflight(device.consent_service()) {
            Ok(status) => {
                log::debug!("{} permission: {}", device, status);
                status
            }
            Err(e) => {
                log::warn!("{} permission preflight failed: {}", device, e);
                PermissionStatus::NotDetermined
            }
        }
    }

    pub fn permissions(&self) -> PermissionMap {
        PermissionMap {
            microphone: self.status(DeviceType::Microphone),
            audio: self.status(DeviceType::SystemAudio),
        }
    }

    /// Trigger the OS consent flow for `device`.
    ///
    /// `completion` runs exactly once with the grant and, on failure, the
    /// reason: the checker's error, a dropped request, or `Timeout`. It runs
    /// on whatever thread produced the answer.
    pub fn request_permission<F>(&self, device: DeviceType, completion: F)
    where
        F: FnOnce(bool, Option<CaptureError>) + Send + 'static,
    {
        log::info!("Requesting {} permission", device);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let slot = ConsentSlot::new(move |result| {
            let _ = done_tx.try_send(());
            match result {
                Ok(granted) => {
                    log::info!("{} permission {}", device, if granted { "granted" } else { "not granted" });
                    completion(granted, None)
                }
                Err(e) => {
                    log::warn!("{} permission request failed: {}", device, e);
                    completion(false, Some(e))
                }
            }
        });

        let timer_slot = Arc::clone(&slot);
        let timeout = self.timeout;
        let spawned = thread::Builder::new()
            .name("consent-timeout".into())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                    timer_slot.fire(Err(CaptureError::Timeout));
                }
            });
        if let Err(e) = spawned {
            log::warn!("Consent request for {} runs without a timeout: {}", device, e);
        }

        self.checker
            .request(device.consent_service(), ConsentCompletion::from_slot(slot));
    }
}
