//! Tokio mpsc channel sink implementation.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::sink::Sink;
use crate::TransportError;

/// How often `can_write` re-checks a full channel.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A sink that sends each block to a tokio mpsc channel.
///
/// This is the bridge from the connector's consumer threads into async
/// code (transcription, analysis, network fan-out). The sink never blocks
/// on a full channel: `write` takes nothing and `can_write` waits for
/// capacity up to its timeout.
///
/// # Example
///
/// ```
/// use stream_connector::ChannelSink;
/// use tokio::sync::mpsc;
///
/// let (tx, mut rx) = mpsc::channel::<Vec<u8>>(100);
/// let sink = ChannelSink::new(tx);
///
/// // Attach the sink to a connector, then receive blocks:
/// // while let Some(block) = rx.recv().await { ... }
/// ```
pub struct ChannelSink {
    name: String,
    sender: mpsc::Sender<Vec<u8>>,
    open: bool,
}

impl ChannelSink {
    /// Creates a new channel sink with the given sender.
    ///
    /// Capacity is counted in blocks, not bytes.
    pub fn new(sender: mpsc::Sender<Vec<u8>>) -> Self {
        Self::with_name("channel", sender)
    }

    /// Creates a new channel sink with a custom name.
    pub fn with_name(name: impl Into<String>, sender: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            sender,
            open: false,
        }
    }
}

impl Sink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.sender.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn can_write(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        if !self.open {
            return Ok(false);
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.sender.is_closed() {
                return Err(TransportError::ChannelClosed);
            }
            if self.sender.capacity() > 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        match self.sender.try_send(data.to_vec()) {
            Ok(()) => Ok(data.len()),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(0),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::ChannelClosed),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_sends_blocks() {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(10);
        let mut sink = ChannelSink::new(tx);
        sink.open().unwrap();

        assert_eq!(sink.write(&[1, 2, 3]).unwrap(), 3);
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_channel_sink_closed() {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(10);
        let mut sink = ChannelSink::new(tx);
        sink.open().unwrap();

        // Drop the receiver
        drop(rx);

        assert!(matches!(sink.write(&[1]), Err(TransportError::ChannelClosed)));
        assert!(matches!(
            sink.can_write(Duration::ZERO),
            Err(TransportError::ChannelClosed)
        ));
    }

    #[test]
    fn test_channel_sink_open_fails_without_receiver() {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        assert!(sink.open().is_err());
        assert!(!sink.is_open());
    }

    #[test]
    fn test_channel_sink_full_is_partial_write() {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1);
        let mut sink = ChannelSink::new(tx);
        sink.open().unwrap();

        assert_eq!(sink.write(&[1]).unwrap(), 1);
        assert_eq!(sink.write(&[2]).unwrap(), 0);
        assert!(!sink.can_write(Duration::from_millis(20)).unwrap());

        rx.try_recv().unwrap();
        assert!(sink.can_write(Duration::ZERO).unwrap());
        assert_eq!(sink.write(&[2]).unwrap(), 1);
    }

    #[test]
    fn test_channel_sink_requires_open() {
        let (tx, _rx) = mpsc::channel::<Vec<u8>>(10);
        let mut sink = ChannelSink::new(tx);
        assert!(matches!(sink.write(&[1]), Err(TransportError::NotOpen)));
        assert!(!sink.can_write(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_channel_sink_custom_name() {
        let (tx, _rx) = mpsc::channel::<Vec<u8>>(10);
        let sink = ChannelSink::with_name("transcription", tx);
        assert_eq!(sink.name(), "transcription");
    }
}
