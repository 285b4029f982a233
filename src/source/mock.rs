//! Mock audio source for testing without hardware.

use ringbuf::traits::{Producer, Split};
use ringbuf::HeapRb;
use std::time::Duration;

use crate::format::{bytes_to_samples, samples_to_bytes};
use crate::source::Source;
use crate::TransportError;

/// A mock audio source that serves synthetic PCM as a byte stream.
///
/// Samples are stored as 16-bit little-endian PCM. Beyond generating audio,
/// the mock can be scripted to pace its reads, fail to open, or fail on a
/// specific read, so the connectors can be exercised in CI.
///
/// # Example
///
/// ```
/// use stream_connector::{MockSource, Source};
/// use std::time::Duration;
///
/// let mut mock = MockSource::new(16000, 1);
/// mock.generate_silence(100);
/// mock.generate_sine(440.0, 100);
///
/// mock.open().unwrap();
/// let mut buf = [0u8; 6400];
/// assert_eq!(mock.read(&mut buf).unwrap(), 6400);
/// assert_eq!(mock.read(&mut buf).unwrap(), 0); // end of stream
/// ```
pub struct MockSource {
    name: String,
    sample_rate: u32,
    channels: u16,
    data: Vec<u8>,
    cursor: usize,
    open: bool,
    read_delay: Duration,
    reads: usize,
    fail_on_read: Option<usize>,
    fail_open: bool,
}

impl MockSource {
    /// Creates an empty mock source with the given format.
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            name: "mock".to_string(),
            sample_rate,
            channels,
            data: Vec::new(),
            cursor: 0,
            open: false,
            read_delay: Duration::ZERO,
            reads: 0,
            fail_on_read: None,
            fail_open: false,
        }
    }

    /// Creates a mock source configured for speech (16kHz mono).
    pub fn transcription() -> Self {
        Self::new(16000, 1)
    }

    /// Creates a 16kHz mono mock source serving the given raw bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut mock = Self::transcription();
        mock.data = data;
        mock
    }

    /// Creates a source of `count` blocks of `block_size` bytes where every
    /// byte of block `i` equals `i as u8`.
    ///
    /// Reading it with a buffer of `block_size` yields the blocks in order,
    /// which makes gaps and reordering visible at the sink.
    pub fn counting_blocks(block_size: usize, count: usize) -> Self {
        let mut data = Vec::with_capacity(block_size * count);
        for i in 0..count {
            data.extend(std::iter::repeat(i as u8).take(block_size));
        }
        Self::from_bytes(data)
    }

    /// Sets the name reported in logs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Makes every `can_read` take `delay`, like a live device delivering
    /// audio in real time. A delay longer than the poll timeout reads as
    /// "not readable".
    #[must_use]
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Makes the `n`-th call to `read` (0-based) return an error.
    #[must_use]
    pub fn fail_on_read(mut self, n: usize) -> Self {
        self.fail_on_read = Some(n);
        self
    }

    /// Makes `open` fail.
    #[must_use]
    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Returns the sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns the channel count.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Appends silence for the given duration in milliseconds.
    pub fn generate_silence(&mut self, duration_ms: u64) {
        let num_samples = self.samples_for_duration(duration_ms);
        self.data.resize(self.data.len() + num_samples * 2, 0);
    }

    /// Appends a sine wave at the given frequency, same value on every channel.
    pub fn generate_sine(&mut self, frequency: f64, duration_ms: u64) {
        let num_frames = self.samples_for_duration(duration_ms) / self.channels as usize;
        let sample_rate = f64::from(self.sample_rate);

        let samples: Vec<i16> = (0..num_frames)
            .flat_map(|i| {
                let t = i as f64 / sample_rate;
                let value = (2.0 * std::f64::consts::PI * frequency * t).sin();
                std::iter::repeat((value * 32767.0) as i16).take(self.channels as usize)
            })
            .collect();
        self.add_samples(&samples);
    }

    /// Appends deterministic white noise at the given amplitude (0.0-1.0).
    pub fn generate_noise(&mut self, duration_ms: u64, amplitude: f64) {
        let num_samples = self.samples_for_duration(duration_ms);
        let amplitude = i32::from((amplitude * 32767.0) as i16);

        let mut seed: u32 = 12345;
        let samples: Vec<i16> = (0..num_samples)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                let random = ((seed >> 16) as i32 - 32768) as i16;
                (i32::from(random) * amplitude / 32767) as i16
            })
            .collect();
        self.add_samples(&samples);
    }

    /// Appends raw samples.
    pub fn add_samples(&mut self, samples: &[i16]) {
        self.data.extend_from_slice(&samples_to_bytes(samples));
    }

    /// Returns the samples not yet read.
    pub fn samples(&self) -> Vec<i16> {
        bytes_to_samples(&self.data[self.cursor..])
    }

    /// Returns the number of bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Returns the duration of the unread audio.
    pub fn duration(&self) -> Duration {
        let frames = self.remaining() / 2 / self.channels as usize;
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate))
    }

    /// Moves the unread samples into a ring buffer consumer, for feeding a
    /// [`RingSource`](crate::RingSource) the way a capture callback would.
    pub fn into_ring_buffer(self) -> ringbuf::HeapCons<i16> {
        let samples = self.samples();
        let ring_buffer = HeapRb::<i16>::new(samples.len().max(1024));
        let (mut producer, consumer) = ring_buffer.split();
        producer.push_slice(&samples);
        consumer
    }

    fn samples_for_duration(&self, duration_ms: u64) -> usize {
        let frames = (u64::from(self.sample_rate) * duration_ms / 1000) as usize;
        frames * self.channels as usize
    }
}

impl Source for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.fail_open {
            return Err(TransportError::custom("mock source configured to fail open"));
        }
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn can_read(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        if !self.open {
            return Ok(false);
        }
        if self.read_delay > timeout {
            std::thread::sleep(timeout);
            return Ok(false);
        }
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }
        Ok(true)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let index = self.reads;
        self.reads += 1;
        if self.fail_on_read == Some(index) {
            return Err(TransportError::io(
                "mock read",
                std::io::Error::new(std::io::ErrorKind::Other, "scripted read failure"),
            ));
        }

        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.data[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }
}
