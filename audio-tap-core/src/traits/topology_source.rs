use std::sync::Arc;

use crate::models::audio_models::TopologyChange;
use crate::models::error::CaptureError;

/// Callback fired by a `TopologySource` on an OS-chosen thread.
pub type TopologyListener = Arc<dyn Fn(TopologyChange) + Send + Sync + 'static>;

/// Token identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// OS notifications for audio-device configuration changes (device list,
/// default input, default output).
pub trait TopologySource: Send + Sync {
    fn add_listener(&self, listener: TopologyListener) -> Result<ListenerId, CaptureError>;

    fn remove_listener(&self, id: ListenerId) -> Result<(), CaptureError>;
}
