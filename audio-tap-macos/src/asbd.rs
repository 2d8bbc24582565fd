//! Translation of CoreAudio `AudioStreamBasicDescription` values into
//! `AudioFormatDescriptor`.
//!
//! Kept free of FFI types so the mapping rules are testable everywhere.

use audio_tap_core::models::error::CaptureError;
use audio_tap_core::models::format::{AudioFormatDescriptor, SampleFormat};

/// `kAudioFormatLinearPCM` ('lpcm').
pub const FORMAT_LINEAR_PCM: u32 = 0x6C70_636D;

pub const FLAG_IS_FLOAT: u32 = 1 << 0;
pub const FLAG_IS_BIG_ENDIAN: u32 = 1 << 1;
pub const FLAG_IS_SIGNED_INTEGER: u32 = 1 << 2;
pub const FLAG_IS_NON_INTERLEAVED: u32 = 1 << 5;

/// Field-for-field copy of an `AudioStreamBasicDescription`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamDescription {
    pub sample_rate: f64,
    pub format_id: u32,
    pub format_flags: u32,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
    pub bytes_per_frame: u32,
    pub channels_per_frame: u32,
    pub bits_per_channel: u32,
}

impl StreamDescription {
    /// Map to a descriptor the converter accepts. Non-PCM, big-endian,
    /// unsigned, 64-bit float and unpacked 24-bit streams are rejected.
    pub fn to_descriptor(&self) -> Result<AudioFormatDescriptor, CaptureError> {
        if self.format_id != FORMAT_LINEAR_PCM {
            return Err(CaptureError::FormatUnsupported(format!(
                "format id {:#010x} is not linear PCM",
                self.format_id
            )));
        }
        if self.format_flags & FLAG_IS_BIG_ENDIAN != 0 {
            return Err(CaptureError::FormatUnsupported("big-endian samples".into()));
        }

        let interleaved = self.format_flags & FLAG_IS_NON_INTERLEAVED == 0;
        let channels_per_plane = if interleaved { self.channels_per_frame.max(1) } else { 1 };
        let container_bytes = self.bytes_per_frame / channels_per_plane;

        let sample_format = if self.format_flags & FLAG_IS_FLOAT != 0 {
            match self.bits_per_channel {
                32 => SampleFormat::Float32,
                bits => {
                    return Err(CaptureError::FormatUnsupported(format!("{}-bit float samples", bits)));
                }
            }
        } else if self.format_flags & FLAG_IS_SIGNED_INTEGER != 0 {
            match (self.bits_per_channel, container_bytes) {
                (16, 2) => SampleFormat::Int16,
                (24, 3) => SampleFormat::Int24,
                (32, 4) => SampleFormat::Int32,
                (bits, bytes) => {
                    return Err(CaptureError::FormatUnsupported(format!(
                        "{}-bit integer samples in {}-byte containers",
                        bits, bytes
                    )));
                }
            }
        } else {
            return Err(CaptureError::FormatUnsupported("unsigned integer samples".into()));
        };

        let descriptor = AudioFormatDescriptor {
            sample_rate: self.sample_rate,
            channel_count: self.channels_per_frame,
            bits_per_channel: self.bits_per_channel,
            sample_format,
            interleaved,
            bytes_per_frame: self.bytes_per_frame,
            bytes_per_packet: self.bytes_per_packet,
            frames_per_packet: self.frames_per_packet,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}
