//! Source trait and implementations for audio producers.
//!
//! A [`Source`] is an ordered byte stream of PCM audio with bounded-wait
//! readiness polling. The crate provides:
//!
//! - [`MockSource`]: Synthetic audio and scripted behavior for tests
//! - [`RingSource`]: Drains a lock-free ring buffer filled by a capture callback
//! - `DeviceSource` (feature `device`): Captures from a CPAL input device

#[cfg(feature = "device")]
mod device;
mod mock;
mod ring;

#[cfg(feature = "device")]
pub use device::{default_input_device_name, list_input_devices, DeviceConfig, DeviceSource};
pub use mock::MockSource;
pub use ring::RingSource;

use std::time::Duration;

use crate::TransportError;

/// A producer of PCM audio bytes.
///
/// Exactly one source feeds a connector, and only the producer thread
/// touches it.
///
/// # Example
///
/// ```
/// use stream_connector::{Source, TransportError};
/// use std::time::Duration;
///
/// struct Silence {
///     open: bool,
/// }
///
/// impl Source for Silence {
///     fn name(&self) -> &str {
///         "silence"
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
///     fn can_read(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
///         Ok(self.open)
///     }
///
///     fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
///         buf.fill(0);
///         Ok(buf.len())
///     }
///
///     fn close(&mut self) -> Result<(), TransportError> {
///         self.open = false;
///         Ok(())
///     }
/// }
/// ```
pub trait Source: Send {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> &str;

    /// Prepares the underlying transport. No-op when already open.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Returns `true` while the source is open.
    fn is_open(&self) -> bool;

    /// Waits at most `timeout` for the next `read` to make progress.
    ///
    /// Returns `Ok(false)` on timeout or when the source is closed. A source
    /// at end of stream reports `Ok(true)` so the following `read` can
    /// return 0.
    fn can_read(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    /// Reads up to `buf.len()` bytes. Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Releases transport resources. Safe to call when already closed.
    fn close(&mut self) -> Result<(), TransportError>;
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn can_read(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        (**self).can_read(timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_is_object_safe_and_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Box<dyn Source>>();
    }

    #[test]
    fn test_boxed_source_delegates() {
        let mut source: Box<dyn Source> = Box::new(MockSource::from_bytes(vec![1, 2, 3]));
        assert!(!source.is_open());
        source.open().unwrap();
        assert!(source.can_read(Duration::ZERO).unwrap());

        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        source.close().unwrap();
        assert!(!source.is_open());
    }
}
