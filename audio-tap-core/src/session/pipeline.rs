use std::sync::Arc;

use uuid::Uuid;

use crate::models::audio_models::{AggregateDeviceDescription, AudioDevice, AudioObjectId, IoProcId, TapHandle, TopologyChange};
use crate::models::config::CaptureConfiguration;
use crate::models::error::{CaptureError, SetupStep};
use crate::models::format::AudioFormatDescriptor;
use crate::models::state::PipelineState;
use crate::processing::format_converter::FormatConverter;
use crate::session::delivery::{DeliveryState, SessionGeneration};
use crate::traits::capture_backend::{CaptureBackend, TapRequest};

/// OS resources of one established capture path.
///
/// Exists only between a successful setup and the matching teardown.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub tap: TapHandle,
    pub aggregate_device: AudioObjectId,
    pub io_proc: IoProcId,
    pub source_format: AudioFormatDescriptor,
    /// Physical device the tap follows.
    pub underlying_device: AudioDevice,
    /// Delivery generation of this session's IOProc, renewed on every start.
    pub generation: Arc<SessionGeneration>,
}

/// Outcome of checking a topology change against the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Unaffected,
    Lost { device_uid: String, was_capturing: bool },
}

/// Releases everything created by a failing setup attempt, newest first.
struct SetupRollback<'a, B: CaptureBackend> {
    backend: &'a mut B,
    tap: Option<TapHandle>,
    aggregate_device: Option<AudioObjectId>,
    io_proc: Option<(AudioObjectId, IoProcId)>,
}

impl<'a, B: CaptureBackend> SetupRollback<'a, B> {
    fn new(backend: &'a mut B) -> Self {
        Self {
            backend,
            tap: None,
            aggregate_device: None,
            io_proc: None,
        }
    }

    fn commit(mut self) {
        self.tap = None;
        self.aggregate_device = None;
        self.io_proc = None;
    }
}

impl<B: CaptureBackend> Drop for SetupRollback<'_, B> {
    fn drop(&mut self) {
        if let Some((device, proc_id)) = self.io_proc.take() {
            if let Err(e) = self.backend.destroy_io_proc(device, proc_id) {
                log::warn!("Rollback: failed to destroy IOProc: {}", e);
            }
        }
        if let Some(device) = self.aggregate_device.take() {
            if let Err(e) = self.backend.destroy_aggregate_device(device) {
                log::warn!("Rollback: failed to destroy aggregate device {}: {}", device, e);
            }
        }
        if let Some(tap) = self.tap.take() {
            if tap.owned {
                if let Err(e) = self.backend.destroy_tap(&tap) {
                    log::warn!("Rollback: failed to destroy tap {}: {}", tap.id, e);
                }
            }
        }
    }
}

/// Owns the tap / aggregate device / IOProc lifecycle.
///
/// State machine:
/// ```text
/// Idle ──setup_if_needed──▶ Setup ──start──▶ Capturing
///   ▲                        │  ▲              │
///   └────────destroy─────────┘  └────stop──────┘
/// ```
/// `destroy` from `Capturing` stops first. All methods must be called from
/// the audio queue.
pub struct CapturePipeline<B: CaptureBackend> {
    backend: B,
    config: CaptureConfiguration,
    delivery: Arc<DeliveryState>,
    session: Option<CaptureSession>,
    capturing: bool,
}

impl<B: CaptureBackend> CapturePipeline<B> {
    pub fn new(backend: B, config: CaptureConfiguration, delivery: Arc<DeliveryState>) -> Self {
        Self {
            backend,
            config,
            delivery,
            session: None,
            capturing: false,
        }
    }

    pub fn state(&self) -> PipelineState {
        match (&self.session, self.capturing) {
            (None, _) => PipelineState::Idle,
            (Some(_), false) => PipelineState::Setup,
            (Some(_), true) => PipelineState::Capturing,
        }
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn source_format(&self) -> Option<AudioFormatDescriptor> {
        self.session.as_ref().map(|s| s.source_format)
    }

    /// Establish the capture path unless it already exists.
    ///
    /// On failure every resource created by this call is released and the
    /// pipeline stays `Idle`.
    pub fn setup_if_needed(&mut self) -> Result<(), CaptureError> {
        if self.session.is_some() {
            log::debug!("Capture session already set up");
            return Ok(());
        }

        let device_type = self.config.device_type;
        let underlying_device = self
            .backend
            .default_device(device_type)
            .map_err(|e| e.at_step(SetupStep::ResolveDevice))?
            .ok_or(CaptureError::DeviceNotAvailable(device_type))?;
        log::info!(
            "Setting up {} capture on {} ({})",
            device_type,
            underlying_device.name,
            underlying_device.uid
        );

        let request = TapRequest {
            uuid: Uuid::new_v4(),
            device_type,
            underlying_device: underlying_device.clone(),
            mute: self.config.mute_tapped_audio,
            excluded_processes: self.config.excluded_processes.clone(),
        };
        let description = AggregateDeviceDescription {
            name: self.config.aggregate_device_name.clone(),
            uid: format!("{}.{}", self.config.aggregate_device_uid, request.uuid),
            clock_device_uid: underlying_device.uid.clone(),
        };
        let generation = Arc::new(SessionGeneration::default());

        let mut rollback = SetupRollback::new(&mut self.backend);

        let tap = rollback
            .backend
            .create_tap(&request)
            .map_err(|e| e.at_step(SetupStep::CreateTap))?;
        log::debug!("Tap created: id={} uid={}", tap.id, tap.uid);
        rollback.tap = Some(tap.clone());

        let aggregate_device = rollback
            .backend
            .create_aggregate_device(&tap, &description)
            .map_err(|e| e.at_step(SetupStep::CreateAggregateDevice))?;
        log::debug!("Aggregate device created: id={}", aggregate_device);
        rollback.aggregate_device = Some(aggregate_device);

        let source_format = rollback
            .backend
            .stream_format(aggregate_device)
            .map_err(|e| e.at_step(SetupStep::QueryFormat))?;
        log::info!("Source format: {}", source_format);

        let converter = FormatConverter::new(
            source_format,
            self.config.target_format,
            self.config.resample,
            self.config.max_frames_per_buffer,
        )
        .map_err(|e| e.at_step(SetupStep::CreateConverter))?;
        self.delivery
            .reserve_buffers(converter.max_output_bytes(self.config.max_frames_per_buffer));

        let handler = self.delivery.io_proc_handler(Arc::clone(&generation), converter);
        let io_proc = rollback
            .backend
            .create_io_proc(aggregate_device, handler)
            .map_err(|e| e.at_step(SetupStep::RegisterIoProc))?;
        rollback.io_proc = Some((aggregate_device, io_proc));

        rollback.commit();
        self.session = Some(CaptureSession {
            tap,
            aggregate_device,
            io_proc,
            source_format,
            underlying_device,
            generation,
        });
        log::info!("Capture session ready on aggregate device {}", aggregate_device);
        Ok(())
    }

    /// Begin capture, setting up first if needed. Idempotent.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.capturing {
            return Ok(());
        }
        self.setup_if_needed()?;

        let Some(session) = self.session.as_ref() else {
            return Err(CaptureError::Unknown("no session after setup".into()));
        };
        let generation = self.delivery.next_generation();
        session.generation.set(generation);
        self.delivery.activate(generation);
        if let Err(e) = self.backend.start_device(session.aggregate_device, session.io_proc) {
            self.delivery.deactivate();
            return Err(e.at_step(SetupStep::StartDevice));
        }

        self.capturing = true;
        log::info!("Capture started (generation {})", generation);
        Ok(())
    }

    /// Stop capture but keep the session. Idempotent.
    ///
    /// Delivery is deactivated before the device stops, so nothing reaches
    /// the data callback once this returns.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.capturing {
            return Ok(());
        }
        self.delivery.deactivate();
        self.capturing = false;

        if let Some(session) = self.session.as_ref() {
            self.backend
                .stop_device(session.aggregate_device, session.io_proc)?;
        }
        log::info!("Capture stopped");
        Ok(())
    }

    /// Release all OS resources. Idempotent and best-effort: individual
    /// release failures are logged and teardown continues.
    pub fn destroy(&mut self) {
        self.delivery.deactivate();
        let Some(session) = self.session.take() else {
            return;
        };

        if self.capturing {
            self.capturing = false;
            if let Err(e) = self
                .backend
                .stop_device(session.aggregate_device, session.io_proc)
            {
                log::warn!("Failed to stop device during teardown: {}", e);
            }
        }
        if let Err(e) = self
            .backend
            .destroy_io_proc(session.aggregate_device, session.io_proc)
        {
            log::warn!("Failed to destroy IOProc: {}", e);
        }
        if let Err(e) = self.backend.destroy_aggregate_device(session.aggregate_device) {
            log::warn!("Failed to destroy aggregate device {}: {}", session.aggregate_device, e);
        }
        if session.tap.owned {
            if let Err(e) = self.backend.destroy_tap(&session.tap) {
                log::warn!("Failed to destroy tap {}: {}", session.tap.id, e);
            }
        }
        log::info!("Capture session destroyed (generation {})", session.generation.get());
    }

    /// Decide whether `change` removed the device the session depends on.
    pub fn reconcile(&self, change: &TopologyChange) -> Reconciliation {
        let Some(session) = self.session.as_ref() else {
            return Reconciliation::Unaffected;
        };
        let uid = &session.underlying_device.uid;
        if change.contains_uid(uid) {
            Reconciliation::Unaffected
        } else {
            Reconciliation::Lost {
                device_uid: uid.clone(),
                was_capturing: self.capturing,
            }
        }
    }
}

impl<B: CaptureBackend> Drop for CapturePipeline<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::models::audio_models::ChangeReason;
    use crate::models::config::ResamplePolicy;
    use crate::models::format::SampleFormat;
    use crate::models::permission::{DeviceType, PermissionStatus};
    use crate::session::delivery::{AudioChunk, AudioDataCallback};
    use crate::testing::{self, headphones, speakers, Call, FakeBackend};
    use crate::traits::capture_backend::RawAudioBuffers;
    use crossbeam_channel::Receiver;

    fn pipeline() -> (CapturePipeline<FakeBackend>, FakeBackend, Arc<DeliveryState>, Receiver<AudioChunk>) {
        testing::init_logging();
        let fake = FakeBackend::new();
        let (delivery, rx) = DeliveryState::new(8, 1024);
        let pipeline = CapturePipeline::new(fake.clone(), CaptureConfiguration::default(), Arc::clone(&delivery));
        (pipeline, fake, delivery, rx)
    }

    fn stereo_f32(frames: usize) -> Vec<u8> {
        (0..frames * 2).flat_map(|_| 0.5f32.to_le_bytes()).collect()
    }

    #[test]
    fn setup_is_idempotent() {
        let (mut pipeline, fake, _, _) = pipeline();
        pipeline.setup_if_needed().unwrap();
        pipeline.setup_if_needed().unwrap();

        assert_eq!(pipeline.state(), PipelineState::Setup);
        assert_eq!(fake.count(Call::CreateTap), 1);
        assert_eq!(fake.count(Call::CreateAggregate), 1);
        assert_eq!(fake.count(Call::CreateIoProc), 1);
        assert_eq!(fake.live_resources(), 3);
    }

    #[test]
    fn setup_steps_run_in_order() {
        let (mut pipeline, fake, _, _) = pipeline();
        pipeline.setup_if_needed().unwrap();
        assert_eq!(
            fake.calls(),
            vec![
                Call::DefaultDevice,
                Call::CreateTap,
                Call::CreateAggregate,
                Call::StreamFormat,
                Call::CreateIoProc
            ]
        );
        let session = pipeline.session().unwrap();
        assert_eq!(session.underlying_device, speakers());
        assert_eq!(session.source_format.channel_count, 2);
    }

    #[test]
    fn failed_setup_rolls_back_in_reverse_order() {
        let (mut pipeline, fake, _, _) = pipeline();
        fake.fail(Call::CreateIoProc, CaptureError::os("AudioDeviceCreateIOProcID", -50));

        let err = pipeline.setup_if_needed().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::SetupFailed {
                step: SetupStep::RegisterIoProc,
                ..
            }
        ));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(fake.live_resources(), 0);

        let calls = fake.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(tail, &[Call::DestroyAggregate, Call::DestroyTap]);
    }

    #[test]
    fn unsupported_format_fails_setup_without_leaks() {
        let (mut pipeline, fake, _, _) = pipeline();
        fake.set_format(AudioFormatDescriptor::pcm(SampleFormat::Float32, 44_100.0, 2, true));
        pipeline.config.resample = ResamplePolicy::Reject;

        let err = pipeline.setup_if_needed().unwrap_err();
        assert!(matches!(err, CaptureError::FormatUnsupported(_)));
        assert_eq!(fake.live_resources(), 0);
        assert_eq!(fake.count(Call::CreateIoProc), 0);
    }

    #[test]
    fn permission_failure_from_tap_creation_is_preserved() {
        let (mut pipeline, fake, _, _) = pipeline();
        fake.fail(
            Call::CreateTap,
            CaptureError::PermissionDenied {
                device: DeviceType::SystemAudio,
                status: PermissionStatus::Denied,
            },
        );
        assert!(matches!(
            pipeline.setup_if_needed(),
            Err(CaptureError::PermissionDenied { .. })
        ));
        assert_eq!(fake.live_resources(), 0);
    }

    #[test]
    fn missing_default_device_is_reported() {
        let (mut pipeline, fake, _, _) = pipeline();
        fake.set_default_device(None);
        assert_eq!(
            pipeline.setup_if_needed(),
            Err(CaptureError::DeviceNotAvailable(DeviceType::SystemAudio))
        );
        assert_eq!(fake.count(Call::CreateTap), 0);
    }

    #[test]
    fn start_sets_up_and_is_idempotent() {
        let (mut pipeline, fake, _, _) = pipeline();
        pipeline.start().unwrap();
        pipeline.start().unwrap();

        assert_eq!(pipeline.state(), PipelineState::Capturing);
        assert_eq!(fake.count(Call::CreateTap), 1);
        assert_eq!(fake.count(Call::StartDevice), 1);
        assert!(fake.is_running());
    }

    #[test]
    fn failed_start_keeps_session() {
        let (mut pipeline, fake, delivery, _) = pipeline();
        fake.fail(Call::StartDevice, CaptureError::os("AudioDeviceStart", -1));

        assert!(pipeline.start().is_err());
        assert_eq!(pipeline.state(), PipelineState::Setup);
        let generation = pipeline.session().unwrap().generation.get();
        assert!(!delivery.is_active(generation));
    }

    #[test]
    fn stop_keeps_resources() {
        let (mut pipeline, fake, _, _) = pipeline();
        pipeline.stop().unwrap();
        assert!(fake.calls().is_empty());

        pipeline.start().unwrap();
        pipeline.stop().unwrap();
        pipeline.stop().unwrap();

        assert_eq!(pipeline.state(), PipelineState::Setup);
        assert_eq!(fake.count(Call::StopDevice), 1);
        assert_eq!(fake.live_resources(), 3);
        assert!(!fake.is_running());
    }

    #[test]
    fn destroy_releases_everything_once() {
        let (mut pipeline, fake, _, _) = pipeline();
        pipeline.start().unwrap();
        pipeline.destroy();
        pipeline.destroy();

        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(fake.live_resources(), 0);
        assert_eq!(fake.count(Call::StopDevice), 1);
        assert_eq!(fake.count(Call::DestroyIoProc), 1);
        assert_eq!(fake.count(Call::DestroyAggregate), 1);
        assert_eq!(fake.count(Call::DestroyTap), 1);
    }

    #[test]
    fn destroy_continues_past_failures() {
        let (mut pipeline, fake, _, _) = pipeline();
        pipeline.setup_if_needed().unwrap();
        fake.fail(Call::DestroyIoProc, CaptureError::os("AudioDeviceDestroyIOProcID", -1));

        pipeline.destroy();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(fake.count(Call::DestroyAggregate), 1);
        assert_eq!(fake.count(Call::DestroyTap), 1);
    }

    #[test]
    fn late_io_proc_after_destroy_is_not_delivered() {
        let (mut pipeline, fake, delivery, rx) = pipeline();
        let received = Arc::new(Mutex::new(0usize));
        let r = Arc::clone(&received);
        let callback: AudioDataCallback = Arc::new(move |_: &[u8]| *r.lock() += 1);
        delivery.set_callback(Some(callback));

        pipeline.start().unwrap();
        let input = stereo_f32(480);
        fake.fire_io_procs(&RawAudioBuffers::interleaved(&input));
        // one buffer in flight when teardown happens
        pipeline.destroy();
        fake.fire_io_procs(&RawAudioBuffers::interleaved(&input));

        while let Ok(chunk) = rx.try_recv() {
            delivery.deliver(chunk);
        }
        assert_eq!(*received.lock(), 0);
        assert_eq!(delivery.stats().discarded_stale, 1);
    }

    #[test]
    fn new_session_after_destroy_ignores_old_io_proc() {
        let (mut pipeline, fake, delivery, rx) = pipeline();
        pipeline.start().unwrap();
        let first = pipeline.session().unwrap().generation.get();
        pipeline.destroy();
        pipeline.start().unwrap();
        let second = pipeline.session().unwrap().generation.get();
        assert_ne!(first, second);

        // both the old and the new handler fire; only the new one produces
        let input = stereo_f32(480);
        fake.fire_io_procs(&RawAudioBuffers::interleaved(&input));
        let chunks: Vec<_> = rx.try_iter().collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].generation(), second);
        assert_eq!(chunks[0].frames(), 160);
        assert!(delivery.is_active(second));
    }

    #[test]
    fn restart_does_not_deliver_chunks_from_before_stop() {
        let (mut pipeline, fake, delivery, rx) = pipeline();
        let received = Arc::new(Mutex::new(0usize));
        let r = Arc::clone(&received);
        let callback: AudioDataCallback = Arc::new(move |_: &[u8]| *r.lock() += 1);
        delivery.set_callback(Some(callback));

        pipeline.start().unwrap();
        let first = pipeline.session().unwrap().generation.get();
        let input = stereo_f32(480);
        fake.fire_io_procs(&RawAudioBuffers::interleaved(&input));

        pipeline.stop().unwrap();
        pipeline.start().unwrap();
        let second = pipeline.session().unwrap().generation.get();
        assert_ne!(first, second);
        assert_eq!(fake.count(Call::CreateIoProc), 1);

        // the pre-stop chunk is still queued when the session restarts
        while let Ok(chunk) = rx.try_recv() {
            delivery.deliver(chunk);
        }
        assert_eq!(*received.lock(), 0);
        assert_eq!(delivery.stats().discarded_stale, 1);

        fake.fire_io_procs(&RawAudioBuffers::interleaved(&input));
        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.generation(), second);
        delivery.deliver(chunk);
        assert_eq!(*received.lock(), 1);
    }

    #[test]
    fn setup_reserves_pool_for_converted_buffers() {
        let (mut pipeline, fake, delivery, _) = pipeline();
        // 8 kHz to 16 kHz doubles the frame count
        fake.set_format(AudioFormatDescriptor::pcm(SampleFormat::Float32, 8_000.0, 2, true));
        pipeline.setup_if_needed().unwrap();

        let frames = pipeline.config.max_frames_per_buffer;
        assert!(delivery.buffer_bytes() >= frames * 2 * 2);
    }

    #[test]
    fn reconcile_detects_lost_device() {
        let (mut pipeline, _, _, _) = pipeline();
        let unrelated = TopologyChange {
            reason: ChangeReason::DeviceListChanged,
            devices: vec![speakers()],
        };
        assert_eq!(pipeline.reconcile(&unrelated), Reconciliation::Unaffected);

        pipeline.start().unwrap();
        assert_eq!(pipeline.reconcile(&unrelated), Reconciliation::Unaffected);

        let lost = TopologyChange {
            reason: ChangeReason::DefaultOutputChanged,
            devices: vec![headphones()],
        };
        assert_eq!(
            pipeline.reconcile(&lost),
            Reconciliation::Lost {
                device_uid: speakers().uid,
                was_capturing: true,
            }
        );
    }

    #[test]
    fn at_most_one_session_across_sequences() {
        let (mut pipeline, fake, _, _) = pipeline();
        for step in 0..24 {
            match step % 4 {
                0 => pipeline.start().unwrap(),
                1 => pipeline.stop().unwrap(),
                2 => pipeline.setup_if_needed().unwrap(),
                _ => {
                    if step % 8 == 3 {
                        pipeline.destroy()
                    }
                }
            }
            let state = pipeline.state();
            assert!(!state.is_capturing() || state.is_setup());
            assert!(fake.live_resources() <= 3);
        }
    }
}
