use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::error::CaptureError;
use crate::models::permission::PermissionStatus;

type ConsentFn = Box<dyn FnOnce(Result<bool, CaptureError>) + Send + 'static>;

/// Fires its function at most once, whoever gets there first.
pub(crate) struct ConsentSlot(Mutex<Option<ConsentFn>>);

impl ConsentSlot {
    pub(crate) fn new(f: impl FnOnce(Result<bool, CaptureError>) + Send + 'static) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Some(Box::new(f)))))
    }

    /// Returns false if the slot already fired.
    pub(crate) fn fire(&self, result: Result<bool, CaptureError>) -> bool {
        let f = self.0.lock().take();
        match f {
            Some(f) => {
                f(result);
                true
            }
            None => false,
        }
    }
}

/// Single-use completion handed to a `ConsentChecker::request` call.
///
/// Fires exactly once: with the checker's answer, with the checker's
/// error, or, if the checker drops it unanswered, with an error.
pub struct ConsentCompletion {
    slot: Arc<ConsentSlot>,
}

impl ConsentCompletion {
    pub fn new(f: impl FnOnce(Result<bool, CaptureError>) + Send + 'static) -> Self {
        Self {
            slot: ConsentSlot::new(f),
        }
    }

    pub(crate) fn from_slot(slot: Arc<ConsentSlot>) -> Self {
        Self { slot }
    }

    pub fn complete(self, granted: bool) {
        self.slot.fire(Ok(granted));
    }

    pub fn fail(self, error: CaptureError) {
        self.slot.fire(Err(error));
    }
}

impl Drop for ConsentCompletion {
    fn drop(&mut self) {
        self.slot.fire(Err(CaptureError::Unknown(
            "consent request dropped without an answer".into(),
        )));
    }
}

/// Capability interface over the OS consent service.
///
/// `service` is a TCC service identifier such as `kTCCServiceMicrophone`.
pub trait ConsentChecker: Send + Sync {
    /// Current consent state without prompting.
    fn preflight(&self, service: &str) -> Result<PermissionStatus, CaptureError>;

    /// Ask the OS to prompt (if it still needs to) and report the grant.
    fn request(&self, service: &str, completion: ConsentCompletion);
}

/// Checker used when the consent service could not be loaded.
///
/// Preflight always fails with `SymbolResolution` (the gateway turns that
/// into `NotDetermined`) and requests complete immediately with the same
/// error.
#[derive(Debug, Clone)]
pub struct UnavailableConsentChecker {
    reason: String,
}

impl UnavailableConsentChecker {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl ConsentChecker for UnavailableConsentChecker {
    fn preflight(&self, _service: &str) -> Result<PermissionStatus, CaptureError> {
        Err(CaptureError::SymbolResolution(self.reason.clone()))
    }

    fn request(&self, _service: &str, completion: ConsentCompletion) {
        completion.fail(CaptureError::SymbolResolution(self.reason.clone()));
    }
}
