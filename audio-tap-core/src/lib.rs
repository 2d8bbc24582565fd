//! # audio-tap-core
//!
//! Platform-agnostic system-audio capture core.
//!
//! Negotiates OS consent, builds a capture path (process tap hosted by a
//! private aggregate device), converts captured audio to one fixed target
//! format and streams it to a single consumer callback, tearing the path
//! down when its device disappears. OS facilities are reached through the
//! traits in `traits/`; the macOS implementation lives in `audio-tap-macos`.
//!
//! ## Architecture
//!
//! ```text
//! audio-tap-core (this crate)
//! ├── traits/       ← CaptureBackend, ConsentChecker, TopologySource, CaptureDelegate
//! ├── models/       ← CaptureError, PipelineState, CaptureConfiguration, formats, permissions
//! ├── processing/   ← FormatConverter (decode, channel map, resample, encode)
//! ├── session/      ← AudioQueue, PermissionGateway, DeviceTopologyMonitor,
//! │                   CapturePipeline, AudioManager
//! ├── host.rs       ← AudioWrapper, HostResult
//! └── logging.rs    ← HostLogger
//! ```

pub mod host;
pub mod logging;
pub mod models;
pub mod processing;
pub mod session;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types at crate root for convenience.
pub use host::{AudioWrapper, HostError, HostResult};
pub use logging::{install_host_logger, HostLogger, LogLevel};
pub use models::audio_models::{AudioDevice, ChangeReason, DeliveryStats, TopologyChange};
pub use models::config::{CaptureConfiguration, ResamplePolicy, SingleFlightPolicy};
pub use models::error::{CaptureError, SetupStep};
pub use models::format::{AudioFormatDescriptor, SampleFormat, TARGET_FORMAT};
pub use models::permission::{DeviceType, PermissionMap, PermissionStatus};
pub use models::state::PipelineState;
pub use processing::format_converter::FormatConverter;
pub use session::delivery::AudioDataCallback;
pub use session::manager::AudioManager;
pub use session::permission_gateway::PermissionGateway;
pub use session::pipeline::{CapturePipeline, CaptureSession, Reconciliation};
pub use session::queue::{AudioQueue, QueueHandle};
pub use session::topology_monitor::DeviceTopologyMonitor;
pub use traits::capture_backend::{CaptureBackend, IoProcHandler, RawAudioBuffers, TapRequest};
pub use traits::capture_delegate::CaptureDelegate;
pub use traits::consent_checker::{ConsentChecker, ConsentCompletion, UnavailableConsentChecker};
pub use traits::topology_source::{ListenerId, TopologyListener, TopologySource};
