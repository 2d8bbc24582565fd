//! `CaptureBackend` on CoreAudio process taps (macOS 14.2+).
//!
//! System audio is captured by a global stereo tap hosted in a private
//! aggregate device clocked by the default output device. Microphone
//! capture wraps the default input device in the same kind of aggregate
//! without a tap.

use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use objc2::rc::Retained;
use objc2::runtime::AnyObject;
use objc2::{msg_send, AnyThread, ClassType};
use objc2_core_audio::{
    AudioDeviceCreateIOProcID, AudioDeviceDestroyIOProcID, AudioDeviceIOProcID, AudioDeviceStart,
    AudioDeviceStop, AudioHardwareCreateAggregateDevice, AudioHardwareCreateProcessTap,
    AudioHardwareDestroyAggregateDevice, AudioHardwareDestroyProcessTap, AudioObjectID, CATapDescription,
    CATapMuteBehavior,
};
use objc2_core_audio_types::{AudioBufferList, AudioTimeStamp};
use objc2_core_foundation::CFDictionary;
use objc2_foundation::{NSArray, NSMutableDictionary, NSNumber, NSString, NSUUID};

use audio_tap_core::models::audio_models::{AggregateDeviceDescription, AudioDevice, AudioObjectId, IoProcId, TapHandle};
use audio_tap_core::models::error::CaptureError;
use audio_tap_core::models::format::AudioFormatDescriptor;
use audio_tap_core::models::permission::DeviceType;
use audio_tap_core::traits::capture_backend::{CaptureBackend, IoProcHandler, RawAudioBuffers, TapRequest};

use crate::properties;
use crate::status;

struct IoProcContext {
    handler: IoProcHandler,
}

struct IoProcRegistration {
    device: AudioObjectID,
    proc_id: AudioDeviceIOProcID,
    context: *mut IoProcContext,
}

/// CoreAudio implementation of `CaptureBackend`.
pub struct CoreAudioBackend {
    next_proc: u64,
    procs: HashMap<u64, IoProcRegistration>,
    /// Tap hosted by each aggregate device this backend created.
    taps: HashMap<AudioObjectID, AudioObjectID>,
}

// Safety: the raw context pointers are owned by this backend and only freed
// after CoreAudio has released the IOProc that uses them.
unsafe impl Send for CoreAudioBackend {}

impl CoreAudioBackend {
    pub fn new() -> Self {
        Self {
            next_proc: 1,
            procs: HashMap::new(),
            taps: HashMap::new(),
        }
    }

    fn excluded_process_objects(pids: &[i32]) -> Vec<Retained<NSNumber>> {
        pids.iter()
            .filter_map(|&pid| match properties::process_object(pid) {
                Ok(Some(object)) => Some(NSNumber::new_u32(object)),
                Ok(None) => {
                    log::debug!("pid {} has no audio process object, not excluded", pid);
                    None
                }
                Err(e) => {
                    log::warn!("failed to resolve pid {}: {}", pid, e);
                    None
                }
            })
            .collect()
    }

    fn release_registration(registration: IoProcRegistration) {
        let status = unsafe { AudioDeviceDestroyIOProcID(registration.device, registration.proc_id) };
        if status == 0 {
            drop(unsafe { Box::from_raw(registration.context) });
        } else {
            // CoreAudio may still call into the context, so it is leaked.
            log::warn!(
                "AudioDeviceDestroyIOProcID on {} failed with {}",
                registration.device,
                status::fourcc(status)
            );
        }
    }
}

impl Default for CoreAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn set_str(dict: &NSMutableDictionary, key: &str, value: &str) {
    let key = NSString::from_str(key);
    let value = NSString::from_str(value);
    unsafe {
        let _: () = msg_send![dict, setObject: &*value, forKey: &*key];
    }
}

fn set_int(dict: &NSMutableDictionary, key: &str, value: i32) {
    let key = NSString::from_str(key);
    unsafe {
        let number: Retained<NSNumber> = msg_send![NSNumber::class(), numberWithInt: value];
        let _: () = msg_send![dict, setObject: &*number, forKey: &*key];
    }
}

/// Store `[{ "uid": uid }]` under `key`.
fn set_uid_list(dict: &NSMutableDictionary, key: &str, uid: &str) {
    let entry: Retained<NSMutableDictionary> = NSMutableDictionary::new();
    set_str(&entry, "uid", uid);
    let key = NSString::from_str(key);
    unsafe {
        let list: Retained<NSArray<AnyObject>> = msg_send![NSArray::<AnyObject>::class(), arrayWithObject: &*entry];
        let _: () = msg_send![dict, setObject: &*list, forKey: &*key];
    }
}

fn aggregate_dictionary(tap: &TapHandle, description: &AggregateDeviceDescription) -> Retained<NSMutableDictionary> {
    let dict: Retained<NSMutableDictionary> = NSMutableDictionary::new();
    set_str(&dict, "uid", &description.uid);
    set_str(&dict, "name", &description.name);
    set_int(&dict, "private", 1);
    set_int(&dict, "stacked", 0);
    set_str(&dict, "master", &description.clock_device_uid);
    set_str(&dict, "clock", &description.clock_device_uid);
    set_uid_list(&dict, "subdevices", &description.clock_device_uid);

    if tap.owned {
        set_int(&dict, "tapautostart", 1);
        set_uid_list(&dict, "taps", &tap.uid);
    }
    dict
}

impl CaptureBackend for CoreAudioBackend {
    fn default_device(&self, device_type: DeviceType) -> Result<Option<AudioDevice>, CaptureError> {
        properties::default_device(device_type)
    }

    fn create_tap(&mut self, request: &TapRequest) -> Result<TapHandle, CaptureError> {
        if request.device_type == DeviceType::Microphone {
            return Ok(TapHandle {
                id: request.underlying_device.id,
                uid: request.underlying_device.uid.clone(),
                owned: false,
            });
        }

        let excluded = Self::excluded_process_objects(&request.excluded_processes);
        let processes = NSArray::from_retained_slice(&excluded);
        let description =
            unsafe { CATapDescription::initStereoGlobalTapButExcludeProcesses(CATapDescription::alloc(), &processes) };
        let uuid = NSUUID::from_bytes(*request.uuid.as_bytes());
        unsafe {
            description.setUUID(&uuid);
            description.setName(&NSString::from_str("audio-tap"));
            description.setPrivate(true);
            description.setMuteBehavior(if request.mute {
                CATapMuteBehavior::Muted
            } else {
                CATapMuteBehavior::Unmuted
            });
        }

        let mut tap_id: AudioObjectID = 0;
        let status = unsafe { AudioHardwareCreateProcessTap(Some(&description), &mut tap_id) };
        status::check("AudioHardwareCreateProcessTap", status, request.device_type)?;

        let uid = unsafe { description.UUID() }.UUIDString().to_string();
        log::info!("Created process tap {} ({})", tap_id, uid);
        Ok(TapHandle {
            id: tap_id,
            uid,
            owned: true,
        })
    }

    fn destroy_tap(&mut self, tap: &TapHandle) -> Result<(), CaptureError> {
        if !tap.owned {
            return Ok(());
        }
        let status = unsafe { AudioHardwareDestroyProcessTap(tap.id) };
        status::check("AudioHardwareDestroyProcessTap", status, DeviceType::SystemAudio)
    }

    fn create_aggregate_device(
        &mut self,
        tap: &TapHandle,
        description: &AggregateDeviceDescription,
    ) -> Result<AudioObjectId, CaptureError> {
        let dict = aggregate_dictionary(tap, description);
        let cf_dict = unsafe { &*(&*dict as *const NSMutableDictionary as *const CFDictionary) };

        let mut device_id: AudioObjectID = 0;
        let status = unsafe { AudioHardwareCreateAggregateDevice(cf_dict, NonNull::from(&mut device_id)) };
        status::check("AudioHardwareCreateAggregateDevice", status, DeviceType::SystemAudio)?;

        if tap.owned {
            self.taps.insert(device_id, tap.id);
        }
        log::info!("Created aggregate device {} ({})", device_id, description.uid);
        Ok(device_id)
    }

    fn destroy_aggregate_device(&mut self, device: AudioObjectId) -> Result<(), CaptureError> {
        self.taps.remove(&device);
        let status = unsafe { AudioHardwareDestroyAggregateDevice(device) };
        status::check("AudioHardwareDestroyAggregateDevice", status, DeviceType::SystemAudio)
    }

    fn stream_format(&self, device: AudioObjectId) -> Result<AudioFormatDescriptor, CaptureError> {
        let asbd = properties::input_format(device, self.taps.get(&device).copied())?;
        log::debug!("device {} stream format {:?}", device, asbd);
        asbd.to_descriptor()
    }

    fn create_io_proc(&mut self, device: AudioObjectId, handler: IoProcHandler) -> Result<IoProcId, CaptureError> {
        let context = Box::into_raw(Box::new(IoProcContext { handler }));
        let mut proc_id: AudioDeviceIOProcID = None;
        let status =
            unsafe { AudioDeviceCreateIOProcID(device, Some(io_proc), context.cast(), NonNull::from(&mut proc_id)) };
        if let Err(e) = status::check("AudioDeviceCreateIOProcID", status, DeviceType::SystemAudio) {
            drop(unsafe { Box::from_raw(context) });
            return Err(e);
        }

        let id = self.next_proc;
        self.next_proc += 1;
        self.procs.insert(
            id,
            IoProcRegistration {
                device,
                proc_id,
                context,
            },
        );
        Ok(IoProcId(id))
    }

    fn destroy_io_proc(&mut self, device: AudioObjectId, proc_id: IoProcId) -> Result<(), CaptureError> {
        match self.procs.remove(&proc_id.0) {
            Some(registration) if registration.device == device => {
                Self::release_registration(registration);
                Ok(())
            }
            Some(registration) => {
                self.procs.insert(proc_id.0, registration);
                Err(CaptureError::Unknown(format!("IOProc {} is not registered on device {}", proc_id.0, device)))
            }
            None => Ok(()),
        }
    }

    fn start_device(&mut self, device: AudioObjectId, proc_id: IoProcId) -> Result<(), CaptureError> {
        let registration = self
            .procs
            .get(&proc_id.0)
            .ok_or_else(|| CaptureError::Unknown(format!("IOProc {} is not registered", proc_id.0)))?;
        let status = unsafe { AudioDeviceStart(device, registration.proc_id) };
        status::check("AudioDeviceStart", status, DeviceType::SystemAudio)
    }

    fn stop_device(&mut self, device: AudioObjectId, proc_id: IoProcId) -> Result<(), CaptureError> {
        let Some(registration) = self.procs.get(&proc_id.0) else {
            return Ok(());
        };
        let status = unsafe { AudioDeviceStop(device, registration.proc_id) };
        status::check("AudioDeviceStop", status, DeviceType::SystemAudio)
    }
}

impl Drop for CoreAudioBackend {
    fn drop(&mut self) {
        for (_, registration) in self.procs.drain() {
            unsafe { AudioDeviceStop(registration.device, registration.proc_id) };
            Self::release_registration(registration);
        }
    }
}

unsafe extern "C-unwind" fn io_proc(
    _device: AudioObjectID,
    _now: NonNull<AudioTimeStamp>,
    input_data: NonNull<AudioBufferList>,
    _input_time: NonNull<AudioTimeStamp>,
    _output_data: NonNull<AudioBufferList>,
    _output_time: NonNull<AudioTimeStamp>,
    client_data: *mut c_void,
) -> i32 {
    if client_data.is_null() {
        return 0;
    }
    let context = &mut *(client_data as *mut IoProcContext);
    let list = input_data.as_ref();

    let mut buffers = RawAudioBuffers::new();
    for i in 0..list.mNumberBuffers as usize {
        let buffer = &*list.mBuffers.as_ptr().add(i);
        let plane: &[u8] = if buffer.mData.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(buffer.mData as *const u8, buffer.mDataByteSize as usize)
        };
        if !buffers.push(plane) {
            break;
        }
    }

    let _ = panic::catch_unwind(AssertUnwindSafe(|| (context.handler)(&buffers)));
    0
}
