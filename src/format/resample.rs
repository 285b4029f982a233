//! Streaming sample rate and channel conversion.
//!
//! Uses linear interpolation, which is fast but may introduce artifacts
//! for large rate changes. Suitable for speech and monitoring streams; a
//! proper codec chain should bring its own resampler.

use crate::format::{mono_to_stereo, stereo_to_mono, PcmFormat};
use crate::TransportError;

/// Linear-interpolation resampler that keeps its phase across blocks.
///
/// Feeding a stream in arbitrary block sizes produces the same output as
/// feeding it at once, apart from the final input frame, which is held
/// back until the next block arrives to interpolate against.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    channels: usize,
    /// Input frames advanced per output frame.
    step: f64,
    /// Read position relative to the first frame of the working buffer.
    pos: f64,
    /// Last frame of the previous block.
    prev: Option<Vec<i16>>,
}

impl LinearResampler {
    /// Creates a resampler for interleaved audio with `channels` channels.
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Self {
        Self {
            channels: usize::from(channels.max(1)),
            step: f64::from(from_rate) / f64::from(to_rate),
            pos: 0.0,
            prev: None,
        }
    }

    /// Resamples one block of whole frames. Trailing partial frames are ignored.
    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        let ch = self.channels;
        let frames_in = input.len() / ch;
        if frames_in == 0 {
            return Vec::new();
        }

        let offset = usize::from(self.prev.is_some());
        let total = frames_in + offset;
        let prev = self.prev.take().unwrap_or_default();
        let frame = |i: usize| frame_at(&prev, input, offset, ch, i);

        let mut output = Vec::with_capacity((frames_in as f64 / self.step).ceil() as usize * ch);
        loop {
            let idx = self.pos.floor() as usize;
            if idx + 1 >= total {
                break;
            }
            let frac = self.pos - idx as f64;
            let (a, b) = (frame(idx), frame(idx + 1));
            for c in 0..ch {
                let s1 = f64::from(a[c]);
                let s2 = f64::from(b[c]);
                output.push((s1 + (s2 - s1) * frac).round() as i16);
            }
            self.pos += self.step;
        }

        self.pos -= (total - 1) as f64;
        self.prev = Some(frame(total - 1).to_vec());
        output
    }

    /// Forgets the carried frame and phase.
    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.prev = None;
    }
}

/// Frame `i` of the working buffer: the carried frame (if any) followed by `input`.
fn frame_at<'a>(prev: &'a [i16], input: &'a [i16], offset: usize, ch: usize, i: usize) -> &'a [i16] {
    if i < offset {
        prev
    } else {
        &input[(i - offset) * ch..(i - offset + 1) * ch]
    }
}

/// Converts interleaved i16 PCM between two [`PcmFormat`]s.
///
/// Supports equal channel counts, stereo → mono and mono → stereo, plus
/// any sample rate change.
///
/// # Example
///
/// ```
/// use stream_connector::format::{FormatConverter, PcmFormat};
///
/// let mut converter =
///     FormatConverter::new(PcmFormat::new(48000, 2), PcmFormat::new(16000, 1)).unwrap();
/// let out = converter.convert(&vec![0i16; 960 * 2]);
/// assert_eq!(out.len(), 320);
/// ```
#[derive(Debug, Clone)]
pub struct FormatConverter {
    from: PcmFormat,
    to: PcmFormat,
    resampler: Option<LinearResampler>,
}

impl FormatConverter {
    /// Creates a converter, rejecting unsupported channel layouts and zero rates.
    pub fn new(from: PcmFormat, to: PcmFormat) -> Result<Self, TransportError> {
        if from.sample_rate == 0 || to.sample_rate == 0 {
            return Err(TransportError::Format {
                reason: "sample rate must be non-zero".to_string(),
            });
        }
        let channels_ok = from.channels == to.channels
            || matches!((from.channels, to.channels), (2, 1) | (1, 2));
        if !channels_ok || from.channels == 0 {
            return Err(TransportError::Format {
                reason: format!(
                    "cannot convert {} channels to {}",
                    from.channels, to.channels
                ),
            });
        }

        let resampler = (from.sample_rate != to.sample_rate)
            .then(|| LinearResampler::new(from.sample_rate, to.sample_rate, to.channels));
        Ok(Self {
            from,
            to,
            resampler,
        })
    }

    /// Input format.
    pub fn input_format(&self) -> PcmFormat {
        self.from
    }

    /// Output format.
    pub fn output_format(&self) -> PcmFormat {
        self.to
    }

    /// Returns `true` if samples pass through unchanged.
    pub fn is_passthrough(&self) -> bool {
        self.from == self.to
    }

    /// Converts one block of whole input frames.
    pub fn convert(&mut self, samples: &[i16]) -> Vec<i16> {
        let remixed = match (self.from.channels, self.to.channels) {
            (2, 1) => stereo_to_mono(samples),
            (1, 2) => mono_to_stereo(samples),
            _ => samples.to_vec(),
        };
        match self.resampler {
            Some(ref mut resampler) => resampler.process(&remixed),
            None => remixed,
        }
    }

    /// Resets any state carried between blocks.
    pub fn reset(&mut self) {
        if let Some(ref mut resampler) = self.resampler {
            resampler.reset();
        }
    }
}
