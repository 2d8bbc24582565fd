//! Device-topology notifications from the CoreAudio system object.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use objc2_core_audio::{
    kAudioHardwarePropertyDefaultInputDevice, kAudioHardwarePropertyDefaultOutputDevice,
    kAudioHardwarePropertyDevices, AudioObjectAddPropertyListener, AudioObjectID, AudioObjectPropertyAddress,
    AudioObjectPropertySelector, AudioObjectRemovePropertyListener,
};
use parking_lot::Mutex;

use audio_tap_core::models::audio_models::{ChangeReason, TopologyChange};
use audio_tap_core::models::error::CaptureError;
use audio_tap_core::models::permission::DeviceType;
use audio_tap_core::traits::topology_source::{ListenerId, TopologyListener, TopologySource};

use crate::properties;
use crate::status;

const WATCHED: [(AudioObjectPropertySelector, ChangeReason); 3] = [
    (kAudioHardwarePropertyDevices, ChangeReason::DeviceListChanged),
    (kAudioHardwarePropertyDefaultInputDevice, ChangeReason::DefaultInputChanged),
    (kAudioHardwarePropertyDefaultOutputDevice, ChangeReason::DefaultOutputChanged),
];

fn reason_for(selector: AudioObjectPropertySelector) -> Option<ChangeReason> {
    WATCHED.iter().find(|(s, _)| *s == selector).map(|(_, reason)| *reason)
}

#[derive(Default)]
struct ListenerSet {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, TopologyListener>>,
}

impl ListenerSet {
    fn notify(&self, reason: ChangeReason) {
        let devices = match properties::list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                log::warn!("dropping {:?} notification, device list unavailable: {}", reason, e);
                return;
            }
        };
        let listeners: Vec<TopologyListener> = self.listeners.lock().values().cloned().collect();
        let change = TopologyChange { reason, devices };
        for listener in listeners {
            listener(change.clone());
        }
    }
}

/// `TopologySource` watching the device list and both default devices.
///
/// The HAL listener is installed while at least one listener is registered.
pub struct CoreAudioTopologySource {
    set: Arc<ListenerSet>,
    installed: Mutex<bool>,
}

impl CoreAudioTopologySource {
    pub fn new() -> Self {
        Self {
            set: Arc::new(ListenerSet::default()),
            installed: Mutex::new(false),
        }
    }

    fn client_data(&self) -> *mut c_void {
        Arc::as_ptr(&self.set) as *mut c_void
    }

    fn install(&self) -> Result<(), CaptureError> {
        for (index, (selector, _)) in WATCHED.iter().enumerate() {
            let mut address = properties::global(*selector);
            let status = unsafe {
                AudioObjectAddPropertyListener(
                    properties::system_object(),
                    NonNull::from(&mut address),
                    Some(property_listener),
                    self.client_data(),
                )
            };
            if let Err(e) = status::check("AudioObjectAddPropertyListener", status, DeviceType::SystemAudio) {
                for (selector, _) in &WATCHED[..index] {
                    self.remove_hal_listener(*selector);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn uninstall(&self) {
        for (selector, _) in WATCHED {
            self.remove_hal_listener(selector);
        }
    }

    fn remove_hal_listener(&self, selector: AudioObjectPropertySelector) {
        let mut address = properties::global(selector);
        let status = unsafe {
            AudioObjectRemovePropertyListener(
                properties::system_object(),
                NonNull::from(&mut address),
                Some(property_listener),
                self.client_data(),
            )
        };
        if status != 0 {
            log::warn!("AudioObjectRemovePropertyListener failed with {}", status::fourcc(status));
        }
    }
}

impl Default for CoreAudioTopologySource {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologySource for CoreAudioTopologySource {
    fn add_listener(&self, listener: TopologyListener) -> Result<ListenerId, CaptureError> {
        let mut installed = self.installed.lock();
        if !*installed {
            self.install()?;
            *installed = true;
            log::debug!("device topology listener installed");
        }
        let id = self.set.next_id.fetch_add(1, Ordering::Relaxed);
        self.set.listeners.lock().insert(id, listener);
        Ok(ListenerId(id))
    }

    fn remove_listener(&self, id: ListenerId) -> Result<(), CaptureError> {
        let mut installed = self.installed.lock();
        let now_empty = {
            let mut listeners = self.set.listeners.lock();
            listeners.remove(&id.0);
            listeners.is_empty()
        };
        if now_empty && *installed {
            self.uninstall();
            *installed = false;
            log::debug!("device topology listener removed");
        }
        Ok(())
    }
}

impl Drop for CoreAudioTopologySource {
    fn drop(&mut self) {
        if *self.installed.get_mut() {
            self.uninstall();
        }
    }
}

unsafe extern "C-unwind" fn property_listener(
    _object: AudioObjectID,
    count: u32,
    addresses: NonNull<AudioObjectPropertyAddress>,
    client_data: *mut c_void,
) -> i32 {
    if client_data.is_null() {
        return 0;
    }
    let set = &*(client_data as *const ListenerSet);
    let addresses = std::slice::from_raw_parts(addresses.as_ptr(), count as usize);
    for address in addresses {
        if let Some(reason) = reason_for(address.mSelector) {
            set.notify(reason);
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_watched_selectors() {
        assert_eq!(reason_for(kAudioHardwarePropertyDevices), Some(ChangeReason::DeviceListChanged));
        assert_eq!(
            reason_for(kAudioHardwarePropertyDefaultOutputDevice),
            Some(ChangeReason::DefaultOutputChanged)
        );
        assert_eq!(reason_for(0x6E6F_7065), None);
    }
}
