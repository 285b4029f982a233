//! Ring buffer source for audio capture callbacks.

use ringbuf::traits::{Consumer, Observer};
use std::time::{Duration, Instant};

use crate::source::Source;
use crate::TransportError;

/// How often `can_read` re-checks the ring buffer while waiting.
///
/// The capture callback has no way to notify a waiter, so readiness is
/// sampled at this interval up to the caller's timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A source that drains i16 samples from a lock-free SPSC ring buffer.
///
/// The producer half lives in a real-time capture callback that must never
/// block; this side turns the samples into a little-endian byte stream.
/// When the producer half is dropped and the buffer is empty the source
/// reports end of stream.
///
/// # Example
///
/// ```
/// use ringbuf::traits::{Producer, Split};
/// use ringbuf::HeapRb;
/// use stream_connector::{RingSource, Source};
/// use std::time::Duration;
///
/// let (mut producer, consumer) = HeapRb::<i16>::new(1024).split();
/// producer.push_slice(&[1, 2, 3]);
///
/// let mut source = RingSource::new(consumer);
/// source.open().unwrap();
/// assert!(source.can_read(Duration::from_millis(10)).unwrap());
///
/// let mut buf = [0u8; 6];
/// assert_eq!(source.read(&mut buf).unwrap(), 6);
/// assert_eq!(buf, [1, 0, 2, 0, 3, 0]);
/// ```
pub struct RingSource {
    name: String,
    consumer: ringbuf::HeapCons<i16>,
    scratch: Vec<i16>,
    open: bool,
}

impl RingSource {
    /// Creates a source draining the given ring buffer consumer.
    pub fn new(consumer: ringbuf::HeapCons<i16>) -> Self {
        Self::with_name("ring", consumer)
    }

    /// Creates a source with a custom name.
    pub fn with_name(name: impl Into<String>, consumer: ringbuf::HeapCons<i16>) -> Self {
        Self {
            name: name.into(),
            consumer,
            scratch: Vec::new(),
            open: false,
        }
    }

    /// Returns the number of samples currently buffered.
    pub fn available(&self) -> usize {
        self.consumer.occupied_len()
    }

    fn producer_gone(&self) -> bool {
        !self.consumer.write_is_held()
    }
}

impl Source for RingSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), TransportError> {
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
        let deadline = Instant::now() + timeout;
        loop {
            if !self.consumer.is_empty() || self.producer_gone() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if buf.len() < 2 {
            // A byte budget that ends mid-sample stops the transfer cleanly
            tracing::debug!(len = buf.len(), "read buffer smaller than one sample");
            return Ok(0);
        }

        self.scratch.resize(buf.len() / 2, 0);
        let n = self.consumer.pop_slice(&mut self.scratch);
        for (dst, sample) in buf.chunks_exact_mut(2).zip(&self.scratch[..n]) {
            dst.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(n * 2)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }
}
