use uuid::Uuid;

use crate::models::audio_models::{AggregateDeviceDescription, AudioDevice, AudioObjectId, IoProcId, TapHandle};
use crate::models::error::CaptureError;
use crate::models::format::AudioFormatDescriptor;
use crate::models::permission::DeviceType;

/// Upper bound on buffer planes one IOProc invocation can carry.
pub const MAX_PLANES: usize = 16;

/// Borrowed view of the buffers the OS hands to an IOProc.
///
/// Interleaved streams arrive as one plane; non-interleaved streams as one
/// plane per channel. Fixed capacity so the real-time thread never
/// allocates to describe its input.
#[derive(Debug, Clone, Copy)]
pub struct RawAudioBuffers<'a> {
    planes: [&'a [u8]; MAX_PLANES],
    len: usize,
}

impl<'a> RawAudioBuffers<'a> {
    pub fn new() -> Self {
        Self {
            planes: [&[]; MAX_PLANES],
            len: 0,
        }
    }

    /// A single interleaved plane.
    pub fn interleaved(data: &'a [u8]) -> Self {
        let mut buffers = Self::new();
        buffers.push(data);
        buffers
    }

    /// Append a plane. Returns false when `MAX_PLANES` is reached.
    pub fn push(&mut self, plane: &'a [u8]) -> bool {
        if self.len == MAX_PLANES {
            return false;
        }
        self.planes[self.len] = plane;
        self.len += 1;
        true
    }

    pub fn planes(&self) -> &[&'a [u8]] {
        &self.planes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for RawAudioBuffers<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Real-time callback registered as an IOProc.
///
/// Invoked on the OS audio thread at buffer-period cadence. Implementations
/// must not block, lock, log or allocate without bound.
pub type IoProcHandler = Box<dyn FnMut(&RawAudioBuffers<'_>) + Send + 'static>;

/// Parameters for creating a process tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapRequest {
    pub uuid: Uuid,
    pub device_type: DeviceType,
    /// Device the tap follows (default output, or default input for the mic).
    pub underlying_device: AudioDevice,
    pub mute: bool,
    pub excluded_processes: Vec<i32>,
}

/// OS facilities the capture pipeline drives.
///
/// Implemented by:
/// - `CoreAudioBackend` (macOS process tap + private aggregate device)
/// - `FakeBackend` in tests
///
/// Every call happens on the serial audio queue. Handles returned here are
/// owned by the pipeline and released through the matching destroy call.
pub trait CaptureBackend: Send + 'static {
    /// Device a new session should follow, or `None` if there is none.
    fn default_device(&self, device_type: DeviceType) -> Result<Option<AudioDevice>, CaptureError>;

    /// Create a tap for the requested device type.
    fn create_tap(&mut self, request: &TapRequest) -> Result<TapHandle, CaptureError>;

    fn destroy_tap(&mut self, tap: &TapHandle) -> Result<(), CaptureError>;

    /// Create an aggregate device hosting `tap`.
    fn create_aggregate_device(
        &mut self,
        tap: &TapHandle,
        description: &AggregateDeviceDescription,
    ) -> Result<AudioObjectId, CaptureError>;

    fn destroy_aggregate_device(&mut self, device: AudioObjectId) -> Result<(), CaptureError>;

    /// Actual input stream format of `device`.
    fn stream_format(&self, device: AudioObjectId) -> Result<AudioFormatDescriptor, CaptureError>;

    fn create_io_proc(&mut self, device: AudioObjectId, handler: IoProcHandler) -> Result<IoProcId, CaptureError>;

    fn destroy_io_proc(&mut self, device: AudioObjectId, proc_id: IoProcId) -> Result<(), CaptureError>;

    /// Ask the OS to start driving `proc_id`.
    fn start_device(&mut self, device: AudioObjectId, proc_id: IoProcId) -> Result<(), CaptureError>;

    fn stop_device(&mut self, device: AudioObjectId, proc_id: IoProcId) -> Result<(), CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_buffers_cap_planes() {
        let data = [0u8; 4];
        let mut buffers = RawAudioBuffers::new();
        assert!(buffers.is_empty());
        for _ in 0..MAX_PLANES {
            assert!(buffers.push(&data));
        }
        assert!(!buffers.push(&data));
        assert_eq!(buffers.len(), MAX_PLANES);
        assert_eq!(buffers.planes().len(), MAX_PLANES);
    }
}
