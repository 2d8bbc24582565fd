use std::fmt;

use serde::{Deserialize, Serialize};

/// Consent state for one capture domain, as reported by the OS.
///
/// The core never invents transitions between these values; it only
/// observes them (preflight) or asks the OS to prompt (request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    NotDetermined,
    Denied,
    Authorized,
    Restricted,
}

impl PermissionStatus {
    /// Map the integer returned by `TCCAccessPreflight`.
    ///
    /// 0 = authorized, 1 = denied, anything else = not yet determined.
    pub fn from_tcc_preflight(value: i32) -> Self {
        match value {
            0 => Self::Authorized,
            1 => Self::Denied,
            _ => Self::NotDetermined,
        }
    }

    pub fn is_authorized(self) -> bool {
        matches!(self, Self::Authorized)
    }

    /// Host-facing string (`not_determined`, `denied`, `authorized`, `restricted`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotDetermined => "not_determined",
            Self::Denied => "denied",
            Self::Authorized => "authorized",
            Self::Restricted => "restricted",
        }
    }
}

impl fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which consent domain and OS capture object an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "microphone")]
    Microphone,
    #[serde(rename = "audio")]
    SystemAudio,
}

impl DeviceType {
    pub const ALL: [DeviceType; 2] = [DeviceType::Microphone, DeviceType::SystemAudio];

    /// TCC service identifier guarding this device type.
    pub fn consent_service(self) -> &'static str {
        match self {
            Self::Microphone => "kTCCServiceMicrophone",
            Self::SystemAudio => "kTCCServiceAudioCapture",
        }
    }

    pub fn as_host_str(self) -> &'static str {
        match self {
            Self::Microphone => "microphone",
            Self::SystemAudio => "audio",
        }
    }

    /// Parse the host's device-type string. Returns `None` for unknown values.
    pub fn from_host_str(value: &str) -> Option<Self> {
        match value {
            "microphone" => Some(Self::Microphone),
            "audio" => Some(Self::SystemAudio),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_host_str())
    }
}

/// Snapshot of the consent state of every device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionMap {
    pub microphone: PermissionStatus,
    pub audio: PermissionStatus,
}

impl PermissionMap {
    pub fn get(&self, device: DeviceType) -> PermissionStatus {
        match device {
            DeviceType::Microphone => self.microphone,
            DeviceType::SystemAudio => self.audio,
        }
    }
}

impl Default for PermissionMap {
    fn default() -> Self {
        Self {
            microphone: PermissionStatus::NotDetermined,
            audio: PermissionStatus::NotDetermined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcc_preflight_mapping() {
        assert_eq!(PermissionStatus::from_tcc_preflight(0), PermissionStatus::Authorized);
        assert_eq!(PermissionStatus::from_tcc_preflight(1), PermissionStatus::Denied);
        assert_eq!(PermissionStatus::from_tcc_preflight(2), PermissionStatus::NotDetermined);
        assert_eq!(PermissionStatus::from_tcc_preflight(-1), PermissionStatus::NotDetermined);
    }

    #[test]
    fn permission_map_serializes_with_host_names() {
        let map = PermissionMap {
            microphone: PermissionStatus::Authorized,
            audio: PermissionStatus::NotDetermined,
        };
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"microphone":"authorized","audio":"not_determined"}"#);
    }

    #[test]
    fn device_type_host_strings() {
        assert_eq!(DeviceType::from_host_str("audio"), Some(DeviceType::SystemAudio));
        assert_eq!(DeviceType::from_host_str("microphone"), Some(DeviceType::Microphone));
        assert_eq!(DeviceType::from_host_str("speaker"), None);
        assert_eq!(
            serde_json::to_string(&DeviceType::SystemAudio).unwrap(),
            r#""audio""#
        );
    }

    #[test]
    fn map_lookup_by_device() {
        let map = PermissionMap {
            microphone: PermissionStatus::Denied,
            audio: PermissionStatus::Restricted,
        };
        assert_eq!(map.get(DeviceType::Microphone), PermissionStatus::Denied);
        assert_eq!(map.get(DeviceType::SystemAudio), PermissionStatus::Restricted);
    }
}
