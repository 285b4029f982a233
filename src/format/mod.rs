//! PCM format helpers.
//!
//! Everything that crosses a [`Source`](crate::Source) or
//! [`Sink`](crate::Sink) is 16-bit signed little-endian interleaved PCM.
//! This module provides:
//! - Byte ↔ sample conversion
//! - Sample format conversion (f32 ↔ i16)
//! - Channel conversion (stereo ↔ mono)
//! - Streaming sample rate conversion via [`FormatConverter`]

mod convert;
mod resample;

pub use convert::{
    bytes_to_samples, f32_to_i16, i16_to_f32, mono_to_stereo, samples_to_bytes, stereo_to_mono,
};
pub use resample::{FormatConverter, LinearResampler};

/// Bytes per 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate and channel layout of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl PcmFormat {
    /// Creates a format description.
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes occupied by one frame (one sample per channel).
    pub const fn frame_bytes(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Bytes per second of audio in this format.
    pub const fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * BYTES_PER_SAMPLE as u32
    }
}

impl Default for PcmFormat {
    /// 16kHz mono, the usual speech capture format.
    fn default() -> Self {
        Self::new(16000, 1)
    }
}
