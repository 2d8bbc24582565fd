use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::audio_models::TopologyChange;
use crate::models::error::CaptureError;
use crate::session::queue::QueueHandle;
use crate::traits::topology_source::{ListenerId, TopologyListener, TopologySource};

/// Subscribes to device-topology notifications and forwards them onto the
/// audio queue. Holds no pipeline logic of its own.
pub struct DeviceTopologyMonitor {
    source: Arc<dyn TopologySource>,
    queue: QueueHandle,
    listener: Mutex<Option<ListenerId>>,
}

impl DeviceTopologyMonitor {
    pub fn new(source: Arc<dyn TopologySource>, queue: QueueHandle) -> Self {
        Self {
            source,
            queue,
            listener: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Register for notifications. `on_change` always runs on the audio
    /// queue. No-op if already started.
    pub fn start<F>(&self, on_change: F) -> Result<(), CaptureError>
    where
        F: Fn(TopologyChange) + Send + Sync + 'static,
    {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Ok(());
        }

        let queue = self.queue.clone();
        let on_change = Arc::new(on_change);
        let forward: TopologyListener = Arc::new(move |change: TopologyChange| {
            log::debug!("Topology change: {:?} ({} devices)", change.reason, change.devices.len());
            let on_change = Arc::clone(&on_change);
            if queue.dispatch(move || on_change(change)).is_err() {
                log::debug!("Dropping topology change, audio queue is gone");
            }
        });

        *listener = Some(self.source.add_listener(forward)?);
        log::info!("Device topology monitoring started");
        Ok(())
    }

    /// Unregister. Safe to call when not started.
    pub fn stop(&self) {
        let Some(id) = self.listener.lock().take() else {
            return;
        };
        match self.source.remove_listener(id) {
            Ok(()) => log::info!("Device topology monitoring stopped"),
            Err(e) => log::warn!("Failed to remove topology listener: {}", e),
        }
    }
}

impl Drop for DeviceTopologyMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
