//! Consent checks through the private TCC framework.
//!
//! `TCCAccessPreflight` and `TCCAccessRequest` are resolved at runtime with
//! dlopen/dlsym. When the framework or a symbol is missing the crate falls
//! back to `UnavailableConsentChecker`, which reports `NotDetermined`.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::{Arc, OnceLock};

use block2::{Block, RcBlock};
use objc2::runtime::Bool;
use objc2_foundation::NSString;
use parking_lot::Mutex;

use audio_tap_core::models::error::CaptureError;
use audio_tap_core::models::permission::PermissionStatus;
use audio_tap_core::traits::consent_checker::{ConsentChecker, ConsentCompletion, UnavailableConsentChecker};

const TCC_PATH: &CStr = c"/System/Library/PrivateFrameworks/TCC.framework/Versions/A/TCC";
const RTLD_LAZY: c_int = 0x1;

extern "C" {
    fn dlopen(filename: *const c_char, flag: c_int) -> *mut c_void;
    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
}

type PreflightFn = unsafe extern "C" fn(service: *const c_void, options: *const c_void) -> c_int;
type RequestFn =
    unsafe extern "C" fn(service: *const c_void, options: *const c_void, completion: *const Block<dyn Fn(Bool)>);

struct TccFns {
    preflight: PreflightFn,
    request: RequestFn,
}

static TCC_FNS: OnceLock<Result<TccFns, String>> = OnceLock::new();

fn resolve() -> Result<TccFns, String> {
    unsafe {
        let handle = dlopen(TCC_PATH.as_ptr(), RTLD_LAZY);
        if handle.is_null() {
            return Err("TCC.framework could not be loaded".into());
        }
        let preflight = dlsym(handle, c"TCCAccessPreflight".as_ptr());
        let request = dlsym(handle, c"TCCAccessRequest".as_ptr());
        if preflight.is_null() || request.is_null() {
            return Err("TCCAccessPreflight or TCCAccessRequest not found".into());
        }
        Ok(TccFns {
            preflight: std::mem::transmute::<*mut c_void, PreflightFn>(preflight),
            request: std::mem::transmute::<*mut c_void, RequestFn>(request),
        })
    }
}

fn tcc_fns() -> Result<&'static TccFns, CaptureError> {
    TCC_FNS
        .get_or_init(resolve)
        .as_ref()
        .map_err(|reason| CaptureError::SymbolResolution(reason.clone()))
}

/// `ConsentChecker` backed by the TCC framework.
pub struct TccConsentChecker {
    fns: &'static TccFns,
}

impl TccConsentChecker {
    /// Resolve the TCC entry points. Resolution is attempted once per process.
    pub fn load() -> Result<Self, CaptureError> {
        Ok(Self { fns: tcc_fns()? })
    }
}

impl ConsentChecker for TccConsentChecker {
    fn preflight(&self, service: &str) -> Result<PermissionStatus, CaptureError> {
        let service = NSString::from_str(service);
        let service_ptr = &*service as *const NSString as *const c_void;
        let result = unsafe { (self.fns.preflight)(service_ptr, std::ptr::null()) };
        log::debug!("TCCAccessPreflight returned {}", result);
        Ok(PermissionStatus::from_tcc_preflight(result))
    }

    fn request(&self, service: &str, completion: ConsentCompletion) {
        let service = NSString::from_str(service);
        let service_ptr = &*service as *const NSString as *const c_void;
        // TCC may invoke the block more than once on some releases.
        let completion = Mutex::new(Some(completion));
        let block = RcBlock::new(move |granted: Bool| {
            if let Some(completion) = completion.lock().take() {
                completion.complete(granted.as_bool());
            }
        });
        unsafe { (self.fns.request)(service_ptr, std::ptr::null(), &*block) };
    }
}

/// The TCC-backed checker, or the degraded one if TCC cannot be resolved.
pub fn consent_checker() -> Arc<dyn ConsentChecker> {
    match TccConsentChecker::load() {
        Ok(checker) => Arc::new(checker),
        Err(e) => {
            log::warn!("consent checks unavailable: {}", e);
            Arc::new(UnavailableConsentChecker::new(e.to_string()))
        }
    }
}
