//! In-crate fakes for the OS-facing traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::models::audio_models::{
    AggregateDeviceDescription, AudioDevice, AudioObjectId, ChangeReason, IoProcId, TapHandle, TopologyChange,
};
use crate::models::error::CaptureError;
use crate::models::format::{AudioFormatDescriptor, SampleFormat};
use crate::models::permission::{DeviceType, PermissionStatus};
use crate::traits::capture_backend::{CaptureBackend, IoProcHandler, RawAudioBuffers, TapRequest};
use crate::traits::consent_checker::{ConsentChecker, ConsentCompletion};
use crate::traits::topology_source::{ListenerId, TopologyListener, TopologySource};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub(crate) fn speakers() -> AudioDevice {
    AudioDevice {
        id: 40,
        uid: "BuiltInSpeakerDevice".into(),
        name: "MacBook Pro Speakers".into(),
    }
}

pub(crate) fn headphones() -> AudioDevice {
    AudioDevice {
        id: 77,
        uid: "USBHeadset:1".into(),
        name: "USB Headset".into(),
    }
}

/// OS call recorded by `FakeBackend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Call {
    DefaultDevice,
    CreateTap,
    DestroyTap,
    CreateAggregate,
    DestroyAggregate,
    StreamFormat,
    CreateIoProc,
    DestroyIoProc,
    StartDevice,
    StopDevice,
}

struct BackendState {
    calls: Vec<Call>,
    failures: HashMap<Call, CaptureError>,
    default_device: Option<AudioDevice>,
    format: AudioFormatDescriptor,
    next_id: AudioObjectId,
    live_taps: Vec<AudioObjectId>,
    live_aggregates: Vec<AudioObjectId>,
    live_procs: Vec<IoProcId>,
    running: Vec<IoProcId>,
    // never removed, so tests can fire callbacks after teardown
    handlers: Vec<(IoProcId, IoProcHandler)>,
    setup_gate: Option<Receiver<()>>,
}

/// Scriptable `CaptureBackend` sharing its state across clones.
#[derive(Clone)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                calls: Vec::new(),
                failures: HashMap::new(),
                default_device: Some(speakers()),
                format: AudioFormatDescriptor::pcm(SampleFormat::Float32, 48_000.0, 2, true),
                next_id: 100,
                live_taps: Vec::new(),
                live_aggregates: Vec::new(),
                live_procs: Vec::new(),
                running: Vec::new(),
                handlers: Vec::new(),
                setup_gate: None,
            })),
        }
    }

    pub(crate) fn fail(&self, call: Call, error: CaptureError) {
        self.state.lock().failures.insert(call, error);
    }

    pub(crate) fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub(crate) fn set_default_device(&self, device: Option<AudioDevice>) {
        self.state.lock().default_device = device;
    }

    pub(crate) fn set_format(&self, format: AudioFormatDescriptor) {
        self.state.lock().format = format;
    }

    /// Make `create_tap` block until the returned sender sends or drops.
    pub(crate) fn hold_setup(&self) -> Sender<()> {
        let (tx, rx) = crossbeam_channel::bounded(0);
        self.state.lock().setup_gate = Some(rx);
        tx
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn count(&self, call: Call) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Taps, aggregate devices and IOProcs currently alive.
    pub(crate) fn live_resources(&self) -> usize {
        let state = self.state.lock();
        state.live_taps.len() + state.live_aggregates.len() + state.live_procs.len()
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.state.lock().running.is_empty()
    }

    /// Invoke every IOProc ever registered, live or destroyed, as the OS
    /// audio thread would.
    pub(crate) fn fire_io_procs(&self, input: &RawAudioBuffers<'_>) {
        let mut state = self.state.lock();
        for (_, handler) in state.handlers.iter_mut() {
            handler(input);
        }
    }

    fn enter(&self, call: Call) -> Result<(), CaptureError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        match state.failures.get(&call) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn allocate_id(state: &mut BackendState) -> AudioObjectId {
        state.next_id += 1;
        state.next_id
    }
}

impl CaptureBackend for FakeBackend {
    fn default_device(&self, _device_type: DeviceType) -> Result<Option<AudioDevice>, CaptureError> {
        self.enter(Call::DefaultDevice)?;
        Ok(self.state.lock().default_device.clone())
    }

    fn create_tap(&mut self, request: &TapRequest) -> Result<TapHandle, CaptureError> {
        self.enter(Call::CreateTap)?;
        let gate = self.state.lock().setup_gate.take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        let mut state = self.state.lock();
        let id = Self::allocate_id(&mut state);
        state.live_taps.push(id);
        Ok(TapHandle {
            id,
            uid: request.uuid.to_string(),
            owned: true,
        })
    }

    fn destroy_tap(&mut self, tap: &TapHandle) -> Result<(), CaptureError> {
        self.enter(Call::DestroyTap)?;
        self.state.lock().live_taps.retain(|id| *id != tap.id);
        Ok(())
    }

    fn create_aggregate_device(
        &mut self,
        _tap: &TapHandle,
        _description: &AggregateDeviceDescription,
    ) -> Result<AudioObjectId, CaptureError> {
        self.enter(Call::CreateAggregate)?;
        let mut state = self.state.lock();
        let id = Self::allocate_id(&mut state);
        state.live_aggregates.push(id);
        Ok(id)
    }

    fn destroy_aggregate_device(&mut self, device: AudioObjectId) -> Result<(), CaptureError> {
        self.enter(Call::DestroyAggregate)?;
        self.state.lock().live_aggregates.retain(|id| *id != device);
        Ok(())
    }

    fn stream_format(&self, _device: AudioObjectId) -> Result<AudioFormatDescriptor, CaptureError> {
        self.enter(Call::StreamFormat)?;
        Ok(self.state.lock().format)
    }

    fn create_io_proc(&mut self, _device: AudioObjectId, handler: IoProcHandler) -> Result<IoProcId, CaptureError> {
        self.enter(Call::CreateIoProc)?;
        let mut state = self.state.lock();
        let proc_id = IoProcId(Self::allocate_id(&mut state) as u64);
        state.live_procs.push(proc_id);
        state.handlers.push((proc_id, handler));
        Ok(proc_id)
    }

    fn destroy_io_proc(&mut self, _device: AudioObjectId, proc_id: IoProcId) -> Result<(), CaptureError> {
        self.enter(Call::DestroyIoProc)?;
        self.state.lock().live_procs.retain(|id| *id != proc_id);
        Ok(())
    }

    fn start_device(&mut self, _device: AudioObjectId, proc_id: IoProcId) -> Result<(), CaptureError> {
        self.enter(Call::StartDevice)?;
        self.state.lock().running.push(proc_id);
        Ok(())
    }

    fn stop_device(&mut self, _device: AudioObjectId, proc_id: IoProcId) -> Result<(), CaptureError> {
        self.enter(Call::StopDevice)?;
        self.state.lock().running.retain(|id| *id != proc_id);
        Ok(())
    }
}

/// How `FakeConsent` answers a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PromptAnswer {
    Grant,
    Deny,
    /// Keep the completion without answering.
    Ignore,
    /// Drop the completion without answering.
    Drop,
}

pub(crate) struct FakeConsent {
    statuses: Mutex<HashMap<String, PermissionStatus>>,
    preflight_error: Mutex<Option<CaptureError>>,
    answer: Mutex<PromptAnswer>,
    held: Mutex<Vec<ConsentCompletion>>,
    requests: AtomicU64,
}

impl FakeConsent {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(HashMap::new()),
            preflight_error: Mutex::new(None),
            answer: Mutex::new(PromptAnswer::Grant),
            held: Mutex::new(Vec::new()),
            requests: AtomicU64::new(0),
        })
    }

    /// Consent already granted for both device types.
    pub(crate) fn authorized() -> Arc<Self> {
        let consent = Self::new();
        consent.set(DeviceType::Microphone, PermissionStatus::Authorized);
        consent.set(DeviceType::SystemAudio, PermissionStatus::Authorized);
        consent
    }

    pub(crate) fn set(&self, device: DeviceType, status: PermissionStatus) {
        self.statuses
            .lock()
            .insert(device.consent_service().to_string(), status);
    }

    pub(crate) fn fail_preflight(&self, error: Option<CaptureError>) {
        *self.preflight_error.lock() = error;
    }

    pub(crate) fn answer_with(&self, answer: PromptAnswer) {
        *self.answer.lock() = answer;
    }

    pub(crate) fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

impl ConsentChecker for FakeConsent {
    fn preflight(&self, service: &str) -> Result<PermissionStatus, CaptureError> {
        if let Some(error) = self.preflight_error.lock().clone() {
            return Err(error);
        }
        Ok(self
            .statuses
            .lock()
            .get(service)
            .copied()
            .unwrap_or(PermissionStatus::NotDetermined))
    }

    fn request(&self, service: &str, completion: ConsentCompletion) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let answer = *self.answer.lock();
        match answer {
            PromptAnswer::Grant | PromptAnswer::Deny => {
                let granted = answer == PromptAnswer::Grant;
                let status = if granted {
                    PermissionStatus::Authorized
                } else {
                    PermissionStatus::Denied
                };
                self.statuses.lock().insert(service.to_string(), status);
                // answer from another thread, like the OS does
                std::thread::spawn(move || completion.complete(granted));
            }
            PromptAnswer::Ignore => self.held.lock().push(completion),
            PromptAnswer::Drop => drop(completion),
        }
    }
}

/// `TopologySource` whose notifications are emitted by the test.
pub(crate) struct FakeTopology {
    listeners: Mutex<HashMap<u64, TopologyListener>>,
    next_id: AtomicU64,
    devices: Mutex<Vec<AudioDevice>>,
}

impl FakeTopology {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            devices: Mutex::new(vec![speakers(), headphones()]),
        })
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Replace the device list and notify from a foreign thread.
    pub(crate) fn set_devices(&self, devices: Vec<AudioDevice>) {
        *self.devices.lock() = devices;
        self.emit(ChangeReason::DeviceListChanged);
    }

    pub(crate) fn emit(&self, reason: ChangeReason) {
        let change = TopologyChange {
            reason,
            devices: self.devices.lock().clone(),
        };
        let listeners: Vec<TopologyListener> = self.listeners.lock().values().cloned().collect();
        let _ = std::thread::spawn(move || {
            for listener in listeners {
                listener(change.clone());
            }
        })
        .join();
    }
}

impl TopologySource for FakeTopology {
    fn add_listener(&self, listener: TopologyListener) -> Result<ListenerId, CaptureError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().insert(id, listener);
        Ok(ListenerId(id))
    }

    fn remove_listener(&self, id: ListenerId) -> Result<(), CaptureError> {
        self.listeners.lock().remove(&id.0);
        Ok(())
    }
}
