//! PCM conversion stage that forwards to another sink.

use std::time::Duration;

use crate::format::{bytes_to_samples, samples_to_bytes, FormatConverter, PcmFormat};
use crate::sink::{write_fully, Sink};
use crate::TransportError;

/// A sink that converts PCM to another rate or channel layout and writes
/// the result to an inner sink.
///
/// This is the shape every encoder stage takes: it owns the next sink in
/// the chain, so a connector sees one sink per output. Bytes that do not
/// make up a whole input frame are carried to the next block, and output
/// the inner sink did not accept is retried before new input is taken.
///
/// # Example
///
/// ```no_run
/// use stream_connector::format::PcmFormat;
/// use stream_connector::{ConvertingSink, FileSink};
///
/// let file = FileSink::wav("speech.wav", PcmFormat::new(16000, 1));
/// let sink = ConvertingSink::new(file, PcmFormat::new(48000, 2), PcmFormat::new(16000, 1))?;
/// # Ok::<(), stream_connector::TransportError>(())
/// ```
pub struct ConvertingSink<S> {
    name: String,
    inner: S,
    converter: FormatConverter,
    /// Input bytes short of a whole frame.
    partial: Vec<u8>,
    /// Converted bytes the inner sink has not taken yet.
    outbox: Vec<u8>,
}

impl<S: Sink> ConvertingSink<S> {
    /// Wraps `inner`, converting from `from` to `to`.
    ///
    /// Fails for unsupported channel layouts or a zero sample rate.
    pub fn new(inner: S, from: PcmFormat, to: PcmFormat) -> Result<Self, TransportError> {
        let converter = FormatConverter::new(from, to)?;
        Ok(Self {
            name: format!("convert:{}", inner.name()),
            inner,
            converter,
            partial: Vec::new(),
            outbox: Vec::new(),
        })
    }

    /// The wrapped sink.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Mutable access to the wrapped sink.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwraps the inner sink, discarding carried state.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn drain_outbox(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if !self.outbox.is_empty() {
            let n = write_fully(&mut self.inner, &self.outbox, timeout)?;
            self.outbox.drain(..n);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.converter.reset();
        self.partial.clear();
        self.outbox.clear();
    }
}

impl<S: Sink> Sink for ConvertingSink<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if !self.inner.is_open() {
            self.reset();
        }
        self.inner.open()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn can_write(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        self.drain_outbox(timeout)?;
        if !self.outbox.is_empty() {
            return Ok(false);
        }
        self.inner.can_write(timeout)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.inner.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.drain_outbox(Duration::ZERO)?;
        if !self.outbox.is_empty() {
            return Ok(0);
        }

        self.partial.extend_from_slice(data);
        let frame = self.converter.input_format().frame_bytes().max(1);
        let whole = self.partial.len() - self.partial.len() % frame;
        if whole > 0 {
            let samples = bytes_to_samples(&self.partial[..whole]);
            self.partial.drain(..whole);
            self.outbox = samples_to_bytes(&self.converter.convert(&samples));
            self.drain_outbox(Duration::ZERO)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.drain_outbox(Duration::ZERO)?;
        self.inner.flush()
    }

    fn cut(&mut self) -> Result<(), TransportError> {
        self.drain_outbox(Duration::ZERO)?;
        self.reset();
        self.inner.cut()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.reset();
        self.inner.close()
    }
}
