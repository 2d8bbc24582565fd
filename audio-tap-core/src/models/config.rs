use std::time::Duration;

use serde::Deserialize;

use super::error::CaptureError;
use super::format::{AudioFormatDescriptor, SampleFormat, TARGET_FORMAT};
use super::permission::DeviceType;

/// What to do when the source and target sample rates differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplePolicy {
    /// Streaming linear interpolation.
    #[default]
    Linear,
    /// Fail setup with `FormatUnsupported`.
    Reject,
}

/// How concurrent `start_capture` calls are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleFlightPolicy {
    /// Later callers wait for the in-flight start and observe its outcome.
    #[default]
    Wait,
    /// Later callers fail immediately with `CaptureError::Busy`.
    Reject,
}

/// Configuration for the audio manager and its capture pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CaptureConfiguration {
    /// Consent domain and capture object (default: system audio).
    pub device_type: DeviceType,

    /// Format delivered to the data callback (default: `TARGET_FORMAT`).
    pub target_format: AudioFormatDescriptor,

    /// Sample-rate conversion policy (default: linear).
    pub resample: ResamplePolicy,

    /// Display name of the private aggregate device.
    pub aggregate_device_name: String,

    /// UID of the private aggregate device.
    pub aggregate_device_uid: String,

    /// Mute the tapped output while capturing (default: false).
    pub mute_tapped_audio: bool,

    /// Process IDs excluded from the global system-audio tap.
    pub excluded_processes: Vec<i32>,

    /// Pre-allocated buffers shared between the IOProc and the audio queue.
    pub buffer_pool_size: usize,

    /// Frames per IOProc buffer the converter pre-allocates for.
    pub max_frames_per_buffer: usize,

    /// Upper bound on waiting for an OS consent answer.
    pub permission_request_timeout_secs: u64,

    /// Resolution of concurrent `start_capture` calls (default: wait).
    pub single_flight: SingleFlightPolicy,

    /// Name of the serial audio queue thread.
    pub queue_label: String,
}

impl CaptureConfiguration {
    pub fn from_json(json: &str) -> Result<Self, CaptureError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CaptureError::Unknown(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn permission_request_timeout(&self) -> Duration {
        Duration::from_secs(self.permission_request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        let target = &self.target_format;
        target.validate()?;
        if target.sample_rate > 192_000.0 {
            return Err(CaptureError::FormatUnsupported(format!(
                "target sample rate too high: {}",
                target.sample_rate
            )));
        }
        if ![1, 2].contains(&target.channel_count) {
            return Err(CaptureError::FormatUnsupported(format!(
                "unsupported target channel count: {}",
                target.channel_count
            )));
        }
        if !target.interleaved {
            return Err(CaptureError::FormatUnsupported("target format must be interleaved".into()));
        }
        if !matches!(target.sample_format, SampleFormat::Int16 | SampleFormat::Float32) {
            return Err(CaptureError::FormatUnsupported(format!(
                "unsupported target sample format: {:?}",
                target.sample_format
            )));
        }
        if self.buffer_pool_size == 0 {
            return Err(CaptureError::Unknown("buffer pool size must be positive".into()));
        }
        if self.max_frames_per_buffer == 0 {
            return Err(CaptureError::Unknown("max frames per buffer must be positive".into()));
        }
        if self.permission_request_timeout_secs == 0 {
            return Err(CaptureError::Unknown("permission request timeout must be positive".into()));
        }
        if self.aggregate_device_uid.is_empty() {
            return Err(CaptureError::Unknown("aggregate device uid must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            device_type: DeviceType::SystemAudio,
            target_format: TARGET_FORMAT,
            resample: ResamplePolicy::Linear,
            aggregate_device_name: "System Audio Tap".into(),
            aggregate_device_uid: "audio-tap.aggregate".into(),
            mute_tapped_audio: false,
            excluded_processes: Vec::new(),
            buffer_pool_size: 32,
            max_frames_per_buffer: 4096,
            permission_request_timeout_secs: 120,
            single_flight: SingleFlightPolicy::Wait,
            queue_label: "audio-queue".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(CaptureConfiguration::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_target_formats() {
        let mut config = CaptureConfiguration::default();
        config.target_format = AudioFormatDescriptor::pcm(SampleFormat::Int16, 16_000.0, 6, true);
        assert!(config.validate().is_err());

        config.target_format = AudioFormatDescriptor::pcm(SampleFormat::Int16, 16_000.0, 2, false);
        assert!(config.validate().is_err());

        config.target_format = AudioFormatDescriptor::pcm(SampleFormat::Int24, 16_000.0, 1, true);
        assert!(config.validate().is_err());

        config.target_format = AudioFormatDescriptor::pcm(SampleFormat::Float32, 48_000.0, 2, true);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_sizes() {
        let config = CaptureConfiguration {
            buffer_pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CaptureConfiguration {
            permission_request_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_json() {
        let config = CaptureConfiguration::from_json(
            r#"{"device_type": "microphone", "single_flight": "reject", "resample": "reject"}"#,
        )
        .unwrap();
        assert_eq!(config.device_type, DeviceType::Microphone);
        assert_eq!(config.single_flight, SingleFlightPolicy::Reject);
        assert_eq!(config.resample, ResamplePolicy::Reject);
        assert_eq!(config.target_format, TARGET_FORMAT);
        assert_eq!(config.buffer_pool_size, 32);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(CaptureConfiguration::from_json("{not json").is_err());
        assert!(CaptureConfiguration::from_json(r#"{"buffer_pool_size": 0}"#).is_err());
    }
}
