//! Sink trait and implementations for audio destinations.
//!
//! A [`Sink`] is any ordered byte consumer: a file, a network stream, or an
//! encoder that forwards to another sink. The crate provides:
//!
//! - [`FileSink`]: Raw or WAV file with rotation on `cut()`
//! - [`ChannelSink`]: Sends blocks to a tokio mpsc channel
//! - [`TcpSink`]: Stream socket with an optional login handshake
//! - [`ConvertingSink`]: Converts PCM format and forwards to an inner sink
//!
//! You can implement the [`Sink`] trait for custom destinations like
//! codec wrappers or HTTP uploads.

mod channel;
mod convert;
mod file;
mod tcp;

pub use channel::ChannelSink;
pub use convert::ConvertingSink;
pub use file::{FileFormat, FileSink};
pub use tcp::{Handshake, TcpSink};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::TransportError;

/// A destination for audio data.
///
/// Sinks receive blocks of PCM bytes from a connector.
///
/// # Implementation Notes
///
/// - Methods take `&mut self`; the connector serializes access through
///   [`SharedSink`]
/// - `write` may accept fewer bytes than offered - that is not an error
/// - An error from `write` marks the sink as failed; the connector decides
///   whether to drop or reopen it
/// - `cut` finishes the current output unit and starts a new one; stateless
///   sinks keep the default no-op
///
/// # Example
///
/// ```
/// use stream_connector::{Sink, TransportError};
/// use std::time::Duration;
///
/// struct CountSink {
///     open: bool,
///     bytes: usize,
/// }
///
/// impl Sink for CountSink {
///     fn name(&self) -> &str {
///         "count"
///     }
///
///     fn open(&mut self) -> Result<(), TransportError> {
///         self.open = true;
///         Ok(())
///     }
///
///     fn is_open(&self) -> bool {
///         self.open
///     }
///
///     fn can_write(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
///         Ok(self.open)
///     }
///
///     fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
///         self.bytes += data.len();
///         Ok(data.len())
///     }
///
///     fn close(&mut self) -> Result<(), TransportError> {
///         self.open = false;
///         Ok(())
///     }
/// }
/// ```
pub trait Sink: Send {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> &str;

    /// Prepares the transport. No-op when already open.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Returns `true` while the sink is open.
    fn is_open(&self) -> bool;

    /// Waits at most `timeout` for the next `write` to make progress.
    ///
    /// Returns `Ok(false)` on timeout or when closed.
    fn can_write(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    /// Writes up to `data.len()` bytes and returns how many were taken.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Pushes internally buffered data to the transport.
    ///
    /// Default implementation does nothing.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Finishes the current output unit and begins a new one.
    ///
    /// Default implementation does nothing.
    fn cut(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Releases transport resources. Safe to call when already closed.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Shared handle to a sink.
///
/// Held by the connector's sink list and, while open, by that sink's
/// consumer thread.
pub type SharedSink = Arc<Mutex<dyn Sink>>;

/// Wraps a sink in a [`SharedSink`] handle.
pub fn shared<S: Sink + 'static>(sink: S) -> SharedSink {
    Arc::new(Mutex::new(sink))
}

/// Writes `data` to `sink`, retrying partial writes while the sink stays
/// writable within `timeout`.
///
/// Returns the number of bytes written, which is less than `data.len()`
/// if the sink stopped being writable or took nothing on two writes in a
/// row. A sink whose `can_write` cannot see a stalled peer still costs at
/// most two blocking writes per call.
pub fn write_fully<S: Sink + ?Sized>(
    sink: &mut S,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, TransportError> {
    let mut written = 0;
    let mut stalled = false;
    while written < data.len() {
        let n = sink.write(&data[written..])?;
        written += n;
        if n > 0 {
            stalled = false;
            continue;
        }
        if stalled || !sink.can_write(timeout)? {
            break;
        }
        stalled = true;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `chunk` bytes per write and becomes unwritable after
    /// `budget` bytes.
    struct TrickleSink {
        chunk: usize,
        budget: usize,
        received: Vec<u8>,
    }

    impl Sink for TrickleSink {
        fn name(&self) -> &str {
            "trickle"
        }

        fn open(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn can_write(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
            Ok(self.received.len() < self.budget)
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            let room = self.budget - self.received.len();
            let n = data.len().min(self.chunk).min(room);
            self.received.extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn test_write_fully_handles_partial_writes() {
        let mut sink = TrickleSink {
            chunk: 3,
            budget: 100,
            received: Vec::new(),
        };
        let data: Vec<u8> = (0..10).collect();
        assert_eq!(write_fully(&mut sink, &data, Duration::ZERO).unwrap(), 10);
        assert_eq!(sink.received, data);
    }

    #[test]
    fn test_write_fully_stops_when_unwritable() {
        let mut sink = TrickleSink {
            chunk: 4,
            budget: 6,
            received: Vec::new(),
        };
        let data = [1u8; 10];
        assert_eq!(write_fully(&mut sink, &data, Duration::ZERO).unwrap(), 6);
    }

    /// Never takes a byte but always claims to be writable.
    struct StuckSink {
        writes: usize,
    }

    impl Sink for StuckSink {
        fn name(&self) -> &str {
            "stuck"
        }

        fn open(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn can_write(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
            Ok(true)
        }

        fn write(&mut self, _data: &[u8]) -> Result<usize, TransportError> {
            self.writes += 1;
            Ok(0)
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn test_write_fully_gives_up_on_repeated_zero_writes() {
        let mut sink = StuckSink { writes: 0 };
        assert_eq!(write_fully(&mut sink, &[0u8; 64], Duration::ZERO).unwrap(), 0);
        assert_eq!(sink.writes, 2);
    }

    #[test]
    fn test_shared_sink_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SharedSink>();
    }

    #[test]
    fn test_default_cut_and_flush_are_noops() {
        let sink = shared(TrickleSink {
            chunk: 1,
            budget: 1,
            received: Vec::new(),
        });
        let mut guard = sink.lock();
        assert!(guard.cut().is_ok());
        assert!(guard.flush().is_ok());
        assert_eq!(guard.name(), "trickle");
    }
}
