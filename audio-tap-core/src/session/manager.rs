use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::models::audio_models::{DeliveryStats, TopologyChange};
use crate::models::config::{CaptureConfiguration, SingleFlightPolicy};
use crate::models::error::CaptureError;
use crate::models::format::AudioFormatDescriptor;
use crate::models::permission::{DeviceType, PermissionMap, PermissionStatus};
use crate::models::state::PipelineState;
use crate::session::delivery::{AudioDataCallback, DeliveryState};
use crate::session::permission_gateway::PermissionGateway;
use crate::session::pipeline::{CapturePipeline, Reconciliation};
use crate::session::queue::{AudioQueue, QueueHandle};
use crate::session::topology_monitor::DeviceTopologyMonitor;
use crate::traits::capture_backend::CaptureBackend;
use crate::traits::capture_delegate::CaptureDelegate;
use crate::traits::consent_checker::ConsentChecker;
use crate::traits::topology_source::TopologySource;

struct DelegateSlot(Arc<dyn CaptureDelegate>);

/// Observer view of the pipeline, refreshed on the queue after every
/// transition so readers never wait on the queue.
#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    state: PipelineState,
    source_format: Option<AudioFormatDescriptor>,
}

/// Everything queue jobs operate on.
struct Shared<B: CaptureBackend> {
    pipeline: Mutex<CapturePipeline<B>>,
    delivery: Arc<DeliveryState>,
    monitor: DeviceTopologyMonitor,
    delegate: ArcSwapOption<DelegateSlot>,
    snapshot: Mutex<Snapshot>,
}

impl<B: CaptureBackend> Shared<B> {
    fn start(self: &Arc<Self>) -> Result<(), CaptureError> {
        let result = self.pipeline.lock().start();
        if result.is_ok() {
            self.start_monitoring();
        }
        self.publish();
        result
    }

    fn stop(&self) -> Result<(), CaptureError> {
        let result = self.pipeline.lock().stop();
        self.publish();
        result
    }

    fn destroy(&self) {
        self.monitor.stop();
        self.pipeline.lock().destroy();
        self.publish();
    }

    fn start_monitoring(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let started = self.monitor.start(move |change| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_topology_change(change);
            }
        });
        if let Err(e) = started {
            log::warn!("Capturing without device topology monitoring: {}", e);
        }
    }

    /// Runs on the audio queue.
    fn handle_topology_change(&self, change: TopologyChange) {
        let outcome = self.pipeline.lock().reconcile(&change);
        let Reconciliation::Lost {
            device_uid,
            was_capturing,
        } = outcome
        else {
            log::debug!("Topology change does not affect capture ({:?})", change.reason);
            return;
        };

        log::warn!(
            "Capture device {} disappeared ({:?}), tearing down session",
            device_uid,
            change.reason
        );
        self.destroy();
        if was_capturing {
            self.notify_error(&CaptureError::TopologyLost { device_uid });
        }
    }

    /// Refresh the snapshot and tell the delegate about a state change.
    fn publish(&self) {
        let (state, source_format) = {
            let pipeline = self.pipeline.lock();
            (pipeline.state(), pipeline.source_format())
        };
        let changed = {
            let mut snapshot = self.snapshot.lock();
            let changed = snapshot.state != state;
            *snapshot = Snapshot { state, source_format };
            changed
        };
        if changed {
            log::debug!("Pipeline state: {}", state);
            if let Some(delegate) = self.delegate.load_full() {
                delegate.0.on_state_changed(state);
            }
        }
    }

    fn notify_error(&self, error: &CaptureError) {
        log::error!("Capture error: {}", error);
        if let Some(delegate) = self.delegate.load_full() {
            delegate.0.on_error(error);
        }
    }
}

/// Clears the single-flight flag when the start attempt ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Facade coordinating permissions, topology monitoring and the capture
/// pipeline on one serial audio queue.
///
/// Create one per process and hand it to whoever needs it. Dropping it
/// tears down all OS resources and stops the queue.
///
/// ```text
/// start_capture ─▶ PermissionGateway ─▶ [audio queue] CapturePipeline
///                                            ▲              │ IOProc
///              DeviceTopologyMonitor ────────┘              ▼
///                                      converted chunks ─▶ data callback
/// ```
pub struct AudioManager<B: CaptureBackend> {
    config: CaptureConfiguration,
    gateway: PermissionGateway,
    shared: Arc<Shared<B>>,
    start_in_flight: AtomicBool,
    queue: AudioQueue,
}

impl<B: CaptureBackend> AudioManager<B> {
    pub fn new(
        backend: B,
        consent: Arc<dyn ConsentChecker>,
        topology: Arc<dyn TopologySource>,
        config: CaptureConfiguration,
    ) -> Result<Self, CaptureError> {
        config.validate()?;

        let buffer_bytes = config.max_frames_per_buffer * config.target_format.bytes_per_frame as usize;
        let (delivery, chunks) = DeliveryState::new(config.buffer_pool_size, buffer_bytes);
        let sink = Arc::clone(&delivery);
        let queue = AudioQueue::spawn_with_stream(&config.queue_label, chunks, move |chunk| sink.deliver(chunk))?;

        let shared = Arc::new(Shared {
            pipeline: Mutex::new(CapturePipeline::new(backend, config.clone(), Arc::clone(&delivery))),
            delivery,
            monitor: DeviceTopologyMonitor::new(topology, queue.handle()),
            delegate: ArcSwapOption::empty(),
            snapshot: Mutex::new(Snapshot::default()),
        });

        log::info!(
            "Audio manager ready: {} capture, target {}",
            config.device_type,
            config.target_format
        );
        Ok(Self {
            gateway: PermissionGateway::new(consent, config.permission_request_timeout()),
            config,
            shared,
            start_in_flight: AtomicBool::new(false),
            queue,
        })
    }

    pub fn config(&self) -> &CaptureConfiguration {
        &self.config
    }

    pub fn queue(&self) -> QueueHandle {
        self.queue.handle()
    }

    /// Start capturing. Fails fast with `PermissionDenied`, without
    /// touching the OS, unless consent is `Authorized`.
    pub fn start_capture(&self) -> Result<(), CaptureError> {
        let device = self.config.device_type;
        let status = self.gateway.status(device);
        if !status.is_authorized() {
            log::warn!("Not starting capture: {} permission is {}", device, status);
            return Err(CaptureError::PermissionDenied { device, status });
        }

        if self.queue.is_current() {
            return self.shared.start();
        }

        let _in_flight = match self.config.single_flight {
            SingleFlightPolicy::Reject => {
                if self
                    .start_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    log::debug!("Rejecting concurrent start_capture");
                    return Err(CaptureError::Busy);
                }
                Some(InFlight(&self.start_in_flight))
            }
            // jobs are serial, so later callers find the session already up
            SingleFlightPolicy::Wait => None,
        };

        let shared = Arc::clone(&self.shared);
        self.queue.dispatch_sync(move || shared.start())?
    }

    /// Stop capturing, keeping OS resources for a quick restart.
    /// Succeeds without side effects when not capturing.
    pub fn stop_capture(&self) -> Result<(), CaptureError> {
        let shared = Arc::clone(&self.shared);
        self.queue.dispatch_sync(move || shared.stop())?
    }

    /// Release every OS resource and stop topology monitoring. Once this
    /// returns no buffer of any earlier session reaches the data callback.
    pub fn destroy_audio_resources(&self) -> Result<(), CaptureError> {
        let shared = Arc::clone(&self.shared);
        self.queue.dispatch_sync(move || shared.destroy())
    }

    /// Replace the data consumer. Does not start capture.
    pub fn set_audio_data_callback(&self, callback: Option<AudioDataCallback>) {
        self.shared.delivery.set_callback(callback);
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn CaptureDelegate>>) {
        self.shared.delegate.store(delegate.map(|d| Arc::new(DelegateSlot(d))));
    }

    /// Fresh consent snapshot. Never prompts.
    pub fn get_permissions(&self) -> PermissionMap {
        self.gateway.permissions()
    }

    /// Prompt for `device` if consent is still `NotDetermined`, then
    /// complete with the full permission map. `completion` runs exactly
    /// once, on the audio queue.
    pub fn request_permissions<F>(&self, device: DeviceType, completion: F)
    where
        F: FnOnce(PermissionMap) + Send + 'static,
    {
        let queue = self.queue.handle();
        let status = self.gateway.status(device);
        if status != PermissionStatus::NotDetermined {
            log::debug!("{} permission already {}, not prompting", device, status);
            let permissions = self.gateway.permissions();
            run_on_queue(&queue, move || completion(permissions));
            return;
        }

        let gateway = self.gateway.clone();
        self.gateway.request_permission(device, move |_granted, _error| {
            let permissions = gateway.permissions();
            run_on_queue(&queue, move || completion(permissions));
        });
    }

    /// Blocking form of `request_permissions`. Must not be called on the
    /// audio queue.
    pub fn request_permissions_blocking(&self, device: DeviceType) -> Result<PermissionMap, CaptureError> {
        if self.queue.is_current() {
            return Err(CaptureError::Unknown(
                "cannot wait for permissions on the audio queue".into(),
            ));
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.request_permissions(device, move |permissions| {
            let _ = tx.send(permissions);
        });
        rx.recv().map_err(|_| CaptureError::QueueUnavailable)
    }

    pub fn state(&self) -> PipelineState {
        self.shared.snapshot.lock().state
    }

    pub fn is_capturing(&self) -> bool {
        self.state().is_capturing()
    }

    pub fn is_setup(&self) -> bool {
        self.state().is_setup()
    }

    /// Format the OS delivers for the current session, if any.
    pub fn source_format(&self) -> Option<AudioFormatDescriptor> {
        self.shared.snapshot.lock().source_format
    }

    pub fn diagnostics(&self) -> DeliveryStats {
        self.shared.delivery.stats()
    }
}

impl<B: CaptureBackend> Drop for AudioManager<B> {
    fn drop(&mut self) {
        let shared = Arc::clone(&self.shared);
        if let Err(e) = self.queue.dispatch_sync(move || shared.destroy()) {
            log::warn!("Audio manager teardown skipped: {}", e);
        }
        self.queue.shutdown();
    }
}

/// Run `job` on the queue, or inline if the queue is gone, so callers
/// waiting on it are always answered.
fn run_on_queue(queue: &QueueHandle, job: impl FnOnce() + Send + 'static) {
    let job = Arc::new(Mutex::new(Some(job)));
    let queued = Arc::clone(&job);
    let dispatched = queue.dispatch(move || {
        if let Some(job) = queued.lock().take() {
            job();
        }
    });
    if dispatched.is_err() {
        log::debug!("Audio queue gone, completing inline");
        if let Some(job) = job.lock().take() {
            job();
        }
    }
}
