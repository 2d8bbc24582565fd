use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::CaptureError;

/// Linear PCM sample encoding. All encodings are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    Float32,
    Int16,
    /// Packed 3-byte signed integer.
    Int24,
    Int32,
}

impl SampleFormat {
    pub fn bits(self) -> u32 {
        match self {
            Self::Float32 | Self::Int32 => 32,
            Self::Int16 => 16,
            Self::Int24 => 24,
        }
    }

    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }
}

/// Description of a linear PCM stream.
///
/// Mirrors the fields of a CoreAudio `AudioStreamBasicDescription` that
/// matter for conversion. For non-interleaved streams `bytes_per_frame`
/// covers a single channel plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFormatDescriptor {
    pub sample_rate: f64,
    pub channel_count: u32,
    pub bits_per_channel: u32,
    pub sample_format: SampleFormat,
    pub interleaved: bool,
    pub bytes_per_frame: u32,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
}

/// Fixed format delivered to the data callback: 16 kHz, mono, 16-bit.
pub const TARGET_FORMAT: AudioFormatDescriptor = AudioFormatDescriptor {
    sample_rate: 16_000.0,
    channel_count: 1,
    bits_per_channel: 16,
    sample_format: SampleFormat::Int16,
    interleaved: true,
    bytes_per_frame: 2,
    bytes_per_packet: 2,
    frames_per_packet: 1,
};

impl AudioFormatDescriptor {
    /// Build a descriptor with the derived byte fields filled in.
    pub fn pcm(sample_format: SampleFormat, sample_rate: f64, channel_count: u32, interleaved: bool) -> Self {
        let sample_bytes = sample_format.bytes() as u32;
        let bytes_per_frame = if interleaved {
            sample_bytes * channel_count
        } else {
            sample_bytes
        };
        Self {
            sample_rate,
            channel_count,
            bits_per_channel: sample_format.bits(),
            sample_format,
            interleaved,
            bytes_per_frame,
            bytes_per_packet: bytes_per_frame,
            frames_per_packet: 1,
        }
    }

    /// Bytes one frame occupies in a single buffer plane.
    pub fn plane_frame_bytes(&self) -> usize {
        self.bytes_per_frame as usize
    }

    /// Number of buffer planes a callback delivers for this format.
    pub fn plane_count(&self) -> usize {
        if self.interleaved {
            1
        } else {
            self.channel_count as usize
        }
    }

    /// Channels carried by each plane.
    pub fn channels_per_plane(&self) -> usize {
        if self.interleaved {
            self.channel_count as usize
        } else {
            1
        }
    }

    /// Whether `other` runs at the same sample rate (within 0.01 Hz).
    pub fn same_rate(&self, other: &AudioFormatDescriptor) -> bool {
        (self.sample_rate - other.sample_rate).abs() < 0.01
    }

    /// Check the descriptor is internally consistent and convertible.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if !(self.sample_rate > 0.0) || !self.sample_rate.is_finite() {
            return Err(CaptureError::FormatUnsupported(format!(
                "invalid sample rate: {}",
                self.sample_rate
            )));
        }
        if self.channel_count == 0 {
            return Err(CaptureError::FormatUnsupported("zero channels".into()));
        }
        if self.bits_per_channel != self.sample_format.bits() {
            return Err(CaptureError::FormatUnsupported(format!(
                "{} bits per channel does not match {:?}",
                self.bits_per_channel, self.sample_format
            )));
        }
        if self.frames_per_packet != 1 {
            return Err(CaptureError::FormatUnsupported(format!(
                "{} frames per packet (only 1 is supported)",
                self.frames_per_packet
            )));
        }
        let expected = Self::pcm(self.sample_format, self.sample_rate, self.channel_count, self.interleaved);
        if self.bytes_per_frame != expected.bytes_per_frame || self.bytes_per_packet != expected.bytes_per_packet {
            return Err(CaptureError::FormatUnsupported(format!(
                "byte layout mismatch: {} bytes/frame, {} bytes/packet",
                self.bytes_per_frame, self.bytes_per_packet
            )));
        }
        Ok(())
    }
}

impl Default for AudioFormatDescriptor {
    fn default() -> Self {
        TARGET_FORMAT
    }
}

impl fmt::Display for AudioFormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.0}Hz {}ch {:?}{}",
            self.sample_rate,
            self.channel_count,
            self.sample_format,
            if self.interleaved { "" } else { " planar" }
        )
    }
}
