//! Source to sink connectors.
//!
//! [`Connector`] moves blocks from one [`Source`] to a list of sinks on the
//! caller's thread. [`MultiThreadedConnector`] wraps it and gives every sink
//! its own consumer thread, so a slow or failing sink cannot hold up the
//! others.

mod control;
mod threaded;

pub use control::ConnectorHandle;
pub use threaded::MultiThreadedConnector;

use std::sync::Arc;
use std::time::Duration;

use control::Control;

use crate::event::EventSink;
use crate::sink::{shared, write_fully, SharedSink, Sink};
use crate::source::Source;
use crate::stats::StatsState;
use crate::{ConnectorError, ConnectorEvent, ConnectorStats, EventCallback};

/// Single-threaded connector from one source to many sinks.
///
/// Every block is written to each sink in attach order before the next
/// block is read. A sink whose `write` fails is closed and detached.
///
/// # Example
///
/// ```
/// use stream_connector::{Connector, MockSource, Sink, TransportError};
/// use std::time::Duration;
///
/// # struct Discard(bool);
/// # impl Sink for Discard {
/// #     fn name(&self) -> &str { "discard" }
/// #     fn open(&mut self) -> Result<(), TransportError> { self.0 = true; Ok(()) }
/// #     fn is_open(&self) -> bool { self.0 }
/// #     fn can_write(&mut self, _: Duration) -> Result<bool, TransportError> { Ok(self.0) }
/// #     fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> { Ok(data.len()) }
/// #     fn close(&mut self) -> Result<(), TransportError> { self.0 = false; Ok(()) }
/// # }
/// let mut connector = Connector::new(MockSource::counting_blocks(1024, 4));
/// connector.attach(Discard(false))?;
/// connector.open()?;
/// let moved = connector.transfer(0, 1024, Duration::from_millis(100))?;
/// assert_eq!(moved, 4096);
/// connector.close();
/// # Ok::<(), stream_connector::ConnectorError>(())
/// ```
pub struct Connector {
    source: Box<dyn Source>,
    sinks: Vec<SharedSink>,
    open: bool,
    control: Arc<Control>,
    /// Last cut generation applied to the sinks.
    applied_cut: u64,
    events: EventSink,
    stats: Arc<StatsState>,
}

impl Connector {
    /// Creates a closed connector reading from `source`.
    pub fn new<S: Source + 'static>(source: S) -> Self {
        Self::from_boxed(Box::new(source))
    }

    /// Creates a closed connector from an already boxed source.
    pub fn from_boxed(source: Box<dyn Source>) -> Self {
        Self {
            source,
            sinks: Vec::new(),
            open: false,
            control: Arc::new(Control::default()),
            applied_cut: 0,
            events: EventSink::default(),
            stats: Arc::new(StatsState::default()),
        }
    }

    /// Registers a callback for runtime events.
    #[must_use]
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.events = EventSink::new(Some(callback));
        self
    }

    /// Returns a handle that can request cuts and stops from other threads.
    pub fn handle(&self) -> ConnectorHandle {
        ConnectorHandle::new(self.control.clone())
    }

    /// Returns a snapshot of the transfer counters.
    pub fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }

    /// Returns `true` between a successful `open()` and `close()`.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The source this connector reads from.
    pub fn source(&self) -> &dyn Source {
        self.source.as_ref()
    }

    /// Attached sinks in index order.
    pub fn sinks(&self) -> &[SharedSink] {
        &self.sinks
    }

    /// Number of attached sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Attaches a sink and returns its index.
    ///
    /// # Errors
    ///
    /// If the connector is open the sink is opened right away, and a
    /// failure to open is returned as [`ConnectorError::SinkOpenFailed`].
    pub fn attach<S: Sink + 'static>(&mut self, sink: S) -> Result<usize, ConnectorError> {
        self.attach_shared(shared(sink))
    }

    /// Attaches a sink that is also referenced elsewhere.
    ///
    /// # Errors
    ///
    /// See [`attach`](Self::attach).
    pub fn attach_shared(&mut self, sink: SharedSink) -> Result<usize, ConnectorError> {
        if self.open {
            let mut guard = sink.lock();
            if !guard.is_open() {
                guard.open().map_err(|e| ConnectorError::SinkOpenFailed {
                    sink_name: guard.name().to_string(),
                    reason: e.to_string(),
                })?;
            }
        }
        tracing::debug!(sink = %sink.lock().name(), index = self.sinks.len(), "sink attached");
        self.sinks.push(sink);
        Ok(self.sinks.len() - 1)
    }

    /// Removes the sink at `index`, closing it if the connector is open.
    ///
    /// Later sinks shift down by one.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::NoSuchSink`] for an out of range index.
    pub fn detach(&mut self, index: usize) -> Result<SharedSink, ConnectorError> {
        if index >= self.sinks.len() {
            return Err(ConnectorError::NoSuchSink { index });
        }
        let sink = self.sinks.remove(index);
        {
            let mut guard = sink.lock();
            if self.open && guard.is_open() {
                close_sink(&mut *guard);
            }
            tracing::debug!(sink = %guard.name(), index, "sink detached");
        }
        Ok(sink)
    }

    /// Opens the source and every sink.
    ///
    /// All or nothing: on failure whatever was opened is closed again.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::AlreadyOpen`] if already open, otherwise
    /// [`ConnectorError::SourceOpenFailed`] or [`ConnectorError::SinkOpenFailed`].
    pub fn open(&mut self) -> Result<(), ConnectorError> {
        if self.open {
            return Err(ConnectorError::AlreadyOpen);
        }

        let source_was_open = self.source.is_open();
        if !source_was_open {
            self.source
                .open()
                .map_err(|e| ConnectorError::SourceOpenFailed {
                    source_name: self.source.name().to_string(),
                    reason: e.to_string(),
                })?;
        }

        for (index, sink) in self.sinks.iter().enumerate() {
            let mut guard = sink.lock();
            if guard.is_open() {
                continue;
            }
            if let Err(e) = guard.open() {
                let err = ConnectorError::SinkOpenFailed {
                    sink_name: guard.name().to_string(),
                    reason: e.to_string(),
                };
                drop(guard);
                tracing::warn!(error = %err, "connector open failed, rolling back");
                for opened in self.sinks[..index].iter().rev() {
                    close_sink(&mut *opened.lock());
                }
                if !source_was_open {
                    close_source(self.source.as_mut());
                }
                return Err(err);
            }
        }

        self.open = true;
        tracing::info!(
            source = %self.source.name(),
            sinks = self.sinks.len(),
            "connector opened"
        );
        Ok(())
    }

    /// Moves up to `bytes` bytes (`0` for no limit) from the source to the
    /// sinks in blocks of at most `block_size`.
    ///
    /// Stops early on end of stream, when the source is not readable within
    /// `timeout`, when no sinks remain, or on a [`ConnectorHandle::stop`].
    /// Returns the number of bytes read from the source.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::InvalidBlockSize`], [`ConnectorError::NotOpen`], or
    /// [`ConnectorError::Source`] if the source fails.
    pub fn transfer(
        &mut self,
        bytes: u64,
        block_size: usize,
        timeout: Duration,
    ) -> Result<u64, ConnectorError> {
        if block_size == 0 {
            return Err(ConnectorError::InvalidBlockSize);
        }
        if !self.open {
            return Err(ConnectorError::NotOpen);
        }

        let mut buf = vec![0u8; block_size];
        let mut total = 0u64;
        loop {
            if self.control.take_stop() {
                tracing::debug!(total, "transfer stopped on request");
                break;
            }
            if self.take_cut_request() {
                self.cut();
            }
            if self.sinks.is_empty() {
                tracing::debug!(total, "no sinks left, ending transfer");
                break;
            }

            let Some(want) = block_len(bytes, total, block_size) else {
                break;
            };
            let Some(n) = self.read_block(&mut buf[..want], timeout)? else {
                break;
            };
            if n == 0 {
                self.events
                    .emit(ConnectorEvent::SourceExhausted { bytes_read: total });
                tracing::debug!(total, "source exhausted");
                break;
            }
            total += n as u64;
            self.stats.record_block(n);
            self.distribute(&buf[..n], timeout);
        }
        Ok(total)
    }

    /// Asks every open sink to start a new output unit.
    ///
    /// Per-sink failures are logged and reported as events.
    pub fn cut(&mut self) {
        for sink in &self.sinks {
            let mut guard = sink.lock();
            if guard.is_open() {
                cut_sink(&mut *guard, &self.events, &self.stats);
            }
        }
    }

    /// Closes the source and every sink. Errors are logged, not returned.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        close_source(self.source.as_mut());
        for sink in &self.sinks {
            close_sink(&mut *sink.lock());
        }
        self.open = false;
        tracing::info!(source = %self.source.name(), "connector closed");
    }

    /// Returns `true` once per new cut generation requested through a handle.
    fn take_cut_request(&mut self) -> bool {
        let generation = self.control.cut_generation();
        if generation == self.applied_cut {
            return false;
        }
        self.applied_cut = generation;
        true
    }

    /// Polls and reads one block. `Ok(None)` means the source was not readable.
    fn read_block(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, ConnectorError> {
        let readable = self.source.can_read(timeout).map_err(|e| {
            tracing::error!(source = %self.source.name(), error = %e, "source poll failed");
            ConnectorError::Source(e)
        })?;
        if !readable {
            tracing::debug!(source = %self.source.name(), "source not readable, ending transfer");
            return Ok(None);
        }
        let n = self.source.read(buf).map_err(|e| {
            tracing::error!(source = %self.source.name(), error = %e, "source read failed");
            ConnectorError::Source(e)
        })?;
        tracing::trace!(bytes = n, "block read");
        Ok(Some(n))
    }

    fn distribute(&mut self, block: &[u8], timeout: Duration) {
        let mut failed = Vec::new();
        for (index, sink) in self.sinks.iter().enumerate() {
            let mut guard = sink.lock();
            let result = match guard.can_write(timeout) {
                Ok(true) => write_fully(&mut *guard, block, timeout).map(Some),
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(n)) if n < block.len() => {
                    tracing::debug!(sink = %guard.name(), written = n, "partial block");
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::trace!(sink = %guard.name(), "sink not writable, block skipped");
                }
                Err(e) => {
                    tracing::warn!(sink = %guard.name(), error = %e, "sink write failed, detaching");
                    self.stats
                        .sink_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    self.events.emit(ConnectorEvent::SinkWriteFailed {
                        sink_name: guard.name().to_string(),
                        error: e.to_string(),
                    });
                    failed.push(index);
                }
            }
        }

        for index in failed.into_iter().rev() {
            let sink = self.sinks.remove(index);
            let mut guard = sink.lock();
            close_sink(&mut *guard);
            self.events.emit(ConnectorEvent::SinkDetached {
                sink_name: guard.name().to_string(),
            });
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.close();
    }
}

/// Length of the next block, or `None` once the byte budget is spent.
fn block_len(budget: u64, done: u64, block_size: usize) -> Option<usize> {
    if budget == 0 {
        return Some(block_size);
    }
    let left = budget.saturating_sub(done);
    if left == 0 {
        return None;
    }
    Some(usize::try_from(left).map_or(block_size, |left| left.min(block_size)))
}

fn close_source(source: &mut dyn Source) {
    if let Err(e) = source.close() {
        tracing::warn!(source = %source.name(), error = %e, "source close failed");
    }
}

fn close_sink(sink: &mut dyn Sink) {
    if let Err(e) = sink.close() {
        tracing::warn!(sink = %sink.name(), error = %e, "sink close failed");
    }
}

fn cut_sink(sink: &mut dyn Sink, events: &EventSink, stats: &StatsState) {
    match sink.cut() {
        Ok(()) => {
            tracing::debug!(sink = %sink.name(), "sink cut");
            stats.cuts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            events.emit(ConnectorEvent::SinkCut {
                sink_name: sink.name().to_string(),
            });
        }
        Err(e) => {
            tracing::warn!(sink = %sink.name(), error = %e, "sink cut failed");
            events.emit(ConnectorEvent::SinkCutFailed {
                sink_name: sink.name().to_string(),
                error: e.to_string(),
            });
        }
    }
}
