/// OS audio object identifier (`AudioObjectID` on macOS).
pub type AudioObjectId = u32;

/// An audio device as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudioDevice {
    pub id: AudioObjectId,
    pub uid: String,
    pub name: String,
}

/// A process tap (or, for microphone capture, the input device standing in
/// for one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapHandle {
    pub id: AudioObjectId,
    pub uid: String,
    /// False when the handle refers to a device the backend did not create.
    pub owned: bool,
}

/// Registration handle of an IOProc on an aggregate device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoProcId(pub u64);

/// Everything the backend needs to build the private aggregate device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateDeviceDescription {
    pub name: String,
    pub uid: String,
    /// Physical device that clocks the aggregate.
    pub clock_device_uid: String,
}

/// Why the OS reported a topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeReason {
    DeviceListChanged,
    DefaultInputChanged,
    DefaultOutputChanged,
}

/// A device-topology notification with the device list at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyChange {
    pub reason: ChangeReason,
    pub devices: Vec<AudioDevice>,
}

impl TopologyChange {
    pub fn contains_uid(&self, uid: &str) -> bool {
        self.devices.iter().any(|d| d.uid == uid)
    }
}

/// Counters maintained by the real-time path and the delivery loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// IOProc invocations.
    pub callback_count: u64,
    /// Buffers handed to the data callback.
    pub delivered: u64,
    /// Buffers dropped because conversion failed.
    pub dropped_conversion: u64,
    /// Buffers dropped because no pooled buffer or queue slot was free.
    pub dropped_overrun: u64,
    /// Buffers from an inactive session discarded on the queue.
    pub discarded_stale: u64,
}
