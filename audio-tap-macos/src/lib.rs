//! # audio-tap-macos
//!
//! macOS CoreAudio backend for audio-tap-core.
//!
//! Provides:
//! - `CoreAudioBackend`: process tap + private aggregate device + IOProc
//! - `CoreAudioTopologySource`: device list and default-device listeners
//! - `TccConsentChecker`: consent preflight/request through TCC.framework
//! - `asbd`: stream-description mapping (builds on every platform)
//!
//! ## Platform Requirements
//! - macOS 14.2+ for `AudioHardwareCreateProcessTap`
//! - `NSAudioCaptureUsageDescription` in the host app's Info.plist
//!
//! ## Usage
//! ```ignore
//! use audio_tap_core::CaptureConfiguration;
//! use audio_tap_macos::system_audio_manager;
//!
//! let manager = system_audio_manager(CaptureConfiguration::default()).unwrap();
//! manager.set_audio_data_callback(Some(std::sync::Arc::new(|pcm: &[u8]| {
//!     // 16 kHz mono Int16 little-endian
//! })));
//! manager.start_capture().unwrap();
//! ```

pub mod asbd;
pub mod status;

#[cfg(target_os = "macos")]
pub mod core_audio_tap;
#[cfg(target_os = "macos")]
mod properties;
#[cfg(target_os = "macos")]
pub mod tcc;
#[cfg(target_os = "macos")]
pub mod topology;

#[cfg(target_os = "macos")]
pub use core_audio_tap::CoreAudioBackend;
#[cfg(target_os = "macos")]
pub use tcc::{consent_checker, TccConsentChecker};
#[cfg(target_os = "macos")]
pub use topology::CoreAudioTopologySource;

/// An `AudioManager` wired to CoreAudio, TCC and the HAL topology listener.
#[cfg(target_os = "macos")]
pub fn system_audio_manager(
    config: audio_tap_core::CaptureConfiguration,
) -> Result<audio_tap_core::AudioManager<CoreAudioBackend>, audio_tap_core::CaptureError> {
    audio_tap_core::AudioManager::new(
        CoreAudioBackend::new(),
        consent_checker(),
        std::sync::Arc::new(CoreAudioTopologySource::new()),
        config,
    )
}
