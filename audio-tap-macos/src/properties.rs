//! Typed reads of CoreAudio object properties.

use std::ffi::c_void;
use std::mem;
use std::ptr::{self, NonNull};

use objc2::rc::Retained;
use objc2_core_audio::{
    kAudioDevicePropertyDeviceUID, kAudioHardwarePropertyDefaultInputDevice,
    kAudioHardwarePropertyDefaultOutputDevice, kAudioHardwarePropertyDevices,
    kAudioHardwarePropertyTranslatePIDToProcessObject, kAudioObjectPropertyElementMain,
    kAudioObjectPropertyName, kAudioObjectPropertyScopeGlobal, kAudioObjectSystemObject,
    AudioObjectGetPropertyData, AudioObjectGetPropertyDataSize, AudioObjectID,
    AudioObjectPropertyAddress, AudioObjectPropertyScope, AudioObjectPropertySelector,
};
use objc2_core_audio_types::AudioStreamBasicDescription;
use objc2_foundation::NSString;

use audio_tap_core::models::audio_models::AudioDevice;
use audio_tap_core::models::error::CaptureError;
use audio_tap_core::models::permission::DeviceType;

use crate::asbd::StreamDescription;
use crate::status;

/// `kAudioDevicePropertyStreamFormat` ('sfmt').
const DEVICE_STREAM_FORMAT: AudioObjectPropertySelector = 0x7366_6D74;
/// `kAudioTapPropertyFormat` ('tfmt').
const TAP_FORMAT: AudioObjectPropertySelector = 0x7466_6D74;
/// `kAudioObjectPropertyScopeInput` ('inpt').
const SCOPE_INPUT: AudioObjectPropertyScope = 0x696E_7074;

pub(crate) fn system_object() -> AudioObjectID {
    kAudioObjectSystemObject as AudioObjectID
}

pub(crate) fn address(selector: AudioObjectPropertySelector, scope: AudioObjectPropertyScope) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: scope,
        mElement: kAudioObjectPropertyElementMain,
    }
}

pub(crate) fn global(selector: AudioObjectPropertySelector) -> AudioObjectPropertyAddress {
    address(selector, kAudioObjectPropertyScopeGlobal)
}

/// Read a fixed-size property value.
///
/// # Safety
/// `T` must be plain data matching the property's layout.
unsafe fn read<T>(
    object: AudioObjectID,
    mut address: AudioObjectPropertyAddress,
    qualifier: Option<&i32>,
) -> Result<T, i32> {
    let mut value: T = mem::zeroed();
    let mut size = mem::size_of::<T>() as u32;
    let (qualifier_size, qualifier_ptr) = match qualifier {
        Some(q) => (mem::size_of::<i32>() as u32, q as *const i32 as *const c_void),
        None => (0, ptr::null()),
    };
    let status = AudioObjectGetPropertyData(
        object,
        NonNull::from(&mut address),
        qualifier_size,
        qualifier_ptr,
        NonNull::from(&mut size),
        NonNull::from(&mut value).cast(),
    );
    if status != 0 {
        return Err(status);
    }
    Ok(value)
}

fn read_string(object: AudioObjectID, selector: AudioObjectPropertySelector) -> Result<String, CaptureError> {
    let raw: *mut NSString = unsafe { read(object, global(selector), None) }
        .map_err(|status| CaptureError::os("AudioObjectGetPropertyData(string)", status))?;
    // The property getter follows the create rule.
    match unsafe { Retained::from_raw(raw) } {
        Some(string) => Ok(string.to_string()),
        None => Ok(String::new()),
    }
}

pub(crate) fn device_uid(device: AudioObjectID) -> Result<String, CaptureError> {
    read_string(device, kAudioDevicePropertyDeviceUID)
}

pub(crate) fn describe_device(device: AudioObjectID) -> Result<AudioDevice, CaptureError> {
    Ok(AudioDevice {
        id: device,
        uid: device_uid(device)?,
        name: read_string(device, kAudioObjectPropertyName).unwrap_or_default(),
    })
}

/// Current default output (system audio) or input (microphone) device.
pub(crate) fn default_device(device_type: DeviceType) -> Result<Option<AudioDevice>, CaptureError> {
    let selector = match device_type {
        DeviceType::SystemAudio => kAudioHardwarePropertyDefaultOutputDevice,
        DeviceType::Microphone => kAudioHardwarePropertyDefaultInputDevice,
    };
    let id: AudioObjectID = unsafe { read(system_object(), global(selector), None) }
        .map_err(|status| CaptureError::os("read default device", status))?;
    if id == 0 {
        return Ok(None);
    }
    describe_device(id).map(Some)
}

/// Every audio device currently known to the HAL.
pub(crate) fn list_devices() -> Result<Vec<AudioDevice>, CaptureError> {
    let mut address = global(kAudioHardwarePropertyDevices);
    let mut size: u32 = 0;
    let status = unsafe {
        AudioObjectGetPropertyDataSize(system_object(), NonNull::from(&mut address), 0, ptr::null(), NonNull::from(&mut size))
    };
    status::check("AudioObjectGetPropertyDataSize(devices)", status, DeviceType::SystemAudio)?;

    let count = size as usize / mem::size_of::<AudioObjectID>();
    let mut ids: Vec<AudioObjectID> = vec![0; count];
    if count > 0 {
        let ids_ptr = NonNull::new(ids.as_mut_ptr().cast::<c_void>())
            .ok_or_else(|| CaptureError::Unknown("device list buffer is null".into()))?;
        let status = unsafe {
            AudioObjectGetPropertyData(system_object(), NonNull::from(&mut address), 0, ptr::null(), NonNull::from(&mut size), ids_ptr)
        };
        status::check("AudioObjectGetPropertyData(devices)", status, DeviceType::SystemAudio)?;
        ids.truncate(size as usize / mem::size_of::<AudioObjectID>());
    }

    let mut devices = Vec::with_capacity(ids.len());
    for id in ids {
        match describe_device(id) {
            Ok(device) => devices.push(device),
            Err(e) => log::debug!("skipping device {}: {}", id, e),
        }
    }
    Ok(devices)
}

/// HAL process object for `pid`, or `None` if the process has no audio
/// presence.
pub(crate) fn process_object(pid: i32) -> Result<Option<AudioObjectID>, CaptureError> {
    let id: AudioObjectID = unsafe {
        read(system_object(), global(kAudioHardwarePropertyTranslatePIDToProcessObject), Some(&pid))
    }
    .map_err(|status| CaptureError::os("translate pid to process object", status))?;
    Ok((id != 0).then_some(id))
}

/// Input stream format of an aggregate device, falling back to the tap's own
/// format when the device does not report one.
pub(crate) fn input_format(device: AudioObjectID, tap: Option<AudioObjectID>) -> Result<StreamDescription, CaptureError> {
    let from_device: Result<AudioStreamBasicDescription, i32> =
        unsafe { read(device, address(DEVICE_STREAM_FORMAT, SCOPE_INPUT), None) };
    let asbd = match (from_device, tap) {
        (Ok(asbd), _) => asbd,
        (Err(status), Some(tap)) => {
            log::debug!("device {} has no input format ({}), reading tap {}", device, status::fourcc(status), tap);
            unsafe { read(tap, global(TAP_FORMAT), None) }
                .map_err(|status| CaptureError::os("read tap format", status))?
        }
        (Err(status), None) => return Err(CaptureError::os("read stream format", status)),
    };
    Ok(StreamDescription {
        sample_rate: asbd.mSampleRate,
        format_id: asbd.mFormatID,
        format_flags: asbd.mFormatFlags,
        bytes_per_packet: asbd.mBytesPerPacket,
        frames_per_packet: asbd.mFramesPerPacket,
        bytes_per_frame: asbd.mBytesPerFrame,
        channels_per_frame: asbd.mChannelsPerFrame,
        bits_per_channel: asbd.mBitsPerChannel,
    })
}
