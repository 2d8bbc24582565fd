use crate::models::error::CaptureError;
use crate::models::state::PipelineState;

/// Event delegate for capture notifications that are not a direct answer
/// to a caller's request (topology loss, state changes).
///
/// All methods are called on the serial audio queue.
/// Implementations should marshal to their own thread if needed.
pub trait CaptureDelegate: Send + Sync {
    /// Called after every pipeline state transition.
    fn on_state_changed(&self, state: PipelineState);

    /// Called when capture ends without the caller asking, e.g.
    /// `CaptureError::TopologyLost`.
    fn on_error(&self, error: &CaptureError);
}
