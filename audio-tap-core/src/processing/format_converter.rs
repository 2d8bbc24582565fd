//! Linear PCM conversion from the OS source format to the fixed target
//! format.
//!
//! Pipeline per IOProc buffer:
//! ```text
//! raw planes → decode (f32, interleaved) → channel map → resample → encode
//! ```
//! All intermediate buffers are allocated up front for
//! `max_frames_per_buffer` frames. Only an IOProc buffer larger than that
//! grows them, once.

use thiserror::Error;

use crate::models::config::ResamplePolicy;
use crate::models::error::CaptureError;
use crate::models::format::{AudioFormatDescriptor, SampleFormat};
use crate::traits::capture_backend::RawAudioBuffers;

/// Per-buffer conversion failure. The buffer is dropped, the stream goes on.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConversionError {
    #[error("expected {expected} buffer planes, got {actual}")]
    PlaneCount { expected: usize, actual: usize },

    #[error("plane of {len} bytes is not a whole number of {frame_bytes}-byte frames")]
    PartialFrame { len: usize, frame_bytes: usize },

    #[error("planes carry different frame counts")]
    UnevenPlanes,
}

/// How source channels become target channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelMap {
    Copy,
    /// Average all source channels into one.
    Downmix,
    /// Repeat the single source channel.
    Duplicate,
    /// Keep the first `n` source channels.
    Truncate,
}

/// Streaming linear-interpolation resampler for interleaved frames.
///
/// Carries its fractional read position and the last input frame across
/// calls so consecutive buffers join without a gap.
#[derive(Debug, Clone)]
struct LinearResampler {
    step: f64,
    position: f64,
    channels: usize,
    previous: Vec<f32>,
}

impl LinearResampler {
    fn new(source_rate: f64, target_rate: f64, channels: usize) -> Self {
        Self {
            step: source_rate / target_rate,
            position: 0.0,
            channels,
            previous: vec![0.0; channels],
        }
    }

    fn reset(&mut self) {
        self.position = 0.0;
        self.previous.fill(0.0);
    }

    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        let channels = self.channels;
        let frames = input.len() / channels;
        if frames == 0 {
            return;
        }

        let last = (frames - 1) as f64;
        while self.position <= last {
            let base = self.position.floor();
            let fraction = (self.position - base) as f32;
            // -1 refers to the final frame of the previous buffer.
            let index = base as isize;
            for ch in 0..channels {
                let s0 = if index < 0 {
                    self.previous[ch]
                } else {
                    input[index as usize * channels + ch]
                };
                let next = (index + 1) as usize;
                let s1 = if next < frames { input[next * channels + ch] } else { s0 };
                output.push(s0 + (s1 - s0) * fraction);
            }
            self.position += self.step;
        }

        self.position -= frames as f64;
        self.previous
            .copy_from_slice(&input[(frames - 1) * channels..frames * channels]);
    }
}

/// Converts raw IOProc buffers in the source format into target-format bytes.
#[derive(Debug, Clone)]
pub struct FormatConverter {
    source: AudioFormatDescriptor,
    target: AudioFormatDescriptor,
    channel_map: ChannelMap,
    resampler: Option<LinearResampler>,
    decoded: Vec<f32>,
    mapped: Vec<f32>,
    resampled: Vec<f32>,
}

impl FormatConverter {
    /// Validate the source → target pair and pre-allocate scratch space.
    pub fn new(
        source: AudioFormatDescriptor,
        target: AudioFormatDescriptor,
        policy: ResamplePolicy,
        max_frames_per_buffer: usize,
    ) -> Result<Self, CaptureError> {
        source.validate()?;
        target.validate()?;

        if !target.interleaved {
            return Err(CaptureError::FormatUnsupported("target format must be interleaved".into()));
        }
        if !matches!(target.sample_format, SampleFormat::Int16 | SampleFormat::Float32) {
            return Err(CaptureError::FormatUnsupported(format!(
                "cannot encode target sample format {:?}",
                target.sample_format
            )));
        }
        if source.plane_count() > crate::traits::capture_backend::MAX_PLANES {
            return Err(CaptureError::FormatUnsupported(format!(
                "{} planar channels exceed the supported maximum",
                source.channel_count
            )));
        }

        let src_ch = source.channel_count;
        let dst_ch = target.channel_count;
        let channel_map = if src_ch == dst_ch {
            ChannelMap::Copy
        } else if dst_ch == 1 {
            ChannelMap::Downmix
        } else if src_ch == 1 {
            ChannelMap::Duplicate
        } else if src_ch > dst_ch {
            ChannelMap::Truncate
        } else {
            return Err(CaptureError::FormatUnsupported(format!(
                "cannot map {} source channels to {} target channels",
                src_ch, dst_ch
            )));
        };

        let resampler = if source.same_rate(&target) {
            None
        } else {
            match policy {
                ResamplePolicy::Linear => Some(LinearResampler::new(
                    source.sample_rate,
                    target.sample_rate,
                    dst_ch as usize,
                )),
                ResamplePolicy::Reject => {
                    return Err(CaptureError::FormatUnsupported(format!(
                        "source rate {} Hz differs from target rate {} Hz and resampling is disabled",
                        source.sample_rate, target.sample_rate
                    )))
                }
            }
        };

        let frames = max_frames_per_buffer.max(1);
        let out_frames = Self::output_frames_bound(&source, &target, frames);
        Ok(Self {
            source,
            target,
            channel_map,
            resampler,
            decoded: Vec::with_capacity(frames * src_ch as usize),
            mapped: Vec::with_capacity(frames * dst_ch as usize),
            resampled: Vec::with_capacity(out_frames * dst_ch as usize),
        })
    }

    pub fn source(&self) -> &AudioFormatDescriptor {
        &self.source
    }

    pub fn target(&self) -> &AudioFormatDescriptor {
        &self.target
    }

    /// Upper bound of target bytes produced from `frames` source frames.
    pub fn max_output_bytes(&self, frames: usize) -> usize {
        Self::output_frames_bound(&self.source, &self.target, frames) * self.target.bytes_per_frame as usize
    }

    fn output_frames_bound(source: &AudioFormatDescriptor, target: &AudioFormatDescriptor, frames: usize) -> usize {
        if source.same_rate(target) {
            frames
        } else {
            (frames as f64 * target.sample_rate / source.sample_rate).ceil() as usize + 2
        }
    }

    /// Forget resampler history, e.g. when a stream restarts.
    pub fn reset(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    /// Convert one IOProc buffer into `out` (cleared first).
    ///
    /// Returns the number of target frames written.
    pub fn convert(&mut self, input: &RawAudioBuffers<'_>, out: &mut Vec<u8>) -> Result<usize, ConversionError> {
        out.clear();
        self.decode(input)?;
        self.map_channels();

        let dst_ch = self.target.channel_count as usize;
        let samples: &[f32] = match self.resampler.as_mut() {
            Some(resampler) => {
                self.resampled.clear();
                resampler.process(&self.mapped, &mut self.resampled);
                &self.resampled
            }
            None => &self.mapped,
        };

        encode(samples, self.target.sample_format, out);
        Ok(samples.len() / dst_ch)
    }

    fn decode(&mut self, input: &RawAudioBuffers<'_>) -> Result<(), ConversionError> {
        self.decoded.clear();
        let planes = input.planes();
        let expected = self.source.plane_count();
        if planes.len() != expected {
            return Err(ConversionError::PlaneCount {
                expected,
                actual: planes.len(),
            });
        }

        let frame_bytes = self.source.plane_frame_bytes();
        let sample_bytes = self.source.sample_format.bytes();
        let format = self.source.sample_format;

        for plane in planes {
            if plane.len() % frame_bytes != 0 {
                return Err(ConversionError::PartialFrame {
                    len: plane.len(),
                    frame_bytes,
                });
            }
        }

        if self.source.interleaved {
            for sample in planes[0].chunks_exact(sample_bytes) {
                self.decoded.push(decode_sample(sample, format));
            }
        } else {
            let frames = planes[0].len() / frame_bytes;
            if planes.iter().any(|p| p.len() / frame_bytes != frames) {
                return Err(ConversionError::UnevenPlanes);
            }
            for frame in 0..frames {
                let offset = frame * sample_bytes;
                for plane in planes {
                    self.decoded
                        .push(decode_sample(&plane[offset..offset + sample_bytes], format));
                }
            }
        }
        Ok(())
    }

    fn map_channels(&mut self) {
        self.mapped.clear();
        let src_ch = self.source.channel_count as usize;
        let dst_ch = self.target.channel_count as usize;

        match self.channel_map {
            ChannelMap::Copy => self.mapped.extend_from_slice(&self.decoded),
            ChannelMap::Downmix => {
                let scale = 1.0 / src_ch as f32;
                for frame in self.decoded.chunks_exact(src_ch) {
                    let sum: f32 = frame.iter().sum();
                    self.mapped.push(sum * scale);
                }
            }
            ChannelMap::Duplicate => {
                for &sample in &self.decoded {
                    for _ in 0..dst_ch {
                        self.mapped.push(sample);
                    }
                }
            }
            ChannelMap::Truncate => {
                for frame in self.decoded.chunks_exact(src_ch) {
                    self.mapped.extend_from_slice(&frame[..dst_ch]);
                }
            }
        }
    }
}

fn decode_sample(bytes: &[u8], format: SampleFormat) -> f32 {
    match format {
        SampleFormat::Float32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        SampleFormat::Int16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0,
        SampleFormat::Int24 => {
            let raw = (bytes[0] as i32) | ((bytes[1] as i32) << 8) | ((bytes[2] as i32) << 16);
            // sign-extend from 24 bits
            ((raw << 8) >> 8) as f32 / 8_388_608.0
        }
        SampleFormat::Int32 => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
    }
}

/// Encode f32 samples `[-1.0, 1.0]` as little-endian target samples.
///
/// Int16 uses the same 32768 scale as decoding, rounded and clamped, so an
/// Int16 source passes through unchanged.
fn encode(samples: &[f32], format: SampleFormat, out: &mut Vec<u8>) {
    match format {
        SampleFormat::Float32 => {
            for &sample in samples {
                out.extend_from_slice(&sample.to_le_bytes());
            }
        }
        _ => {
            for &sample in samples {
                let value = (sample.clamp(-1.0, 1.0) * 32_768.0)
                    .round()
                    .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
}
