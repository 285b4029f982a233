//! Cross-thread control of a running connector.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Requests shared between a connector and its handles.
#[derive(Debug, Default)]
pub(crate) struct Control {
    stop_requested: AtomicBool,
    /// Bumped once per `cut()`; the connector compares against the last
    /// value it applied.
    cut_generation: AtomicU64,
}

impl Control {
    /// Consumes a pending stop request.
    pub(crate) fn take_stop(&self) -> bool {
        self.stop_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn cut_generation(&self) -> u64 {
        self.cut_generation.load(Ordering::Acquire)
    }
}

/// Cloneable handle for steering a connector from another thread or task.
///
/// The connector itself needs `&mut self` for `transfer`, so a signal
/// handler or timer uses a handle instead. Requests are picked up between
/// blocks.
///
/// # Example
///
/// ```
/// use stream_connector::{Connector, MockSource};
///
/// let connector = Connector::new(MockSource::transcription());
/// let handle = connector.handle();
///
/// std::thread::spawn(move || {
///     handle.cut();
///     handle.stop();
/// });
/// ```
#[derive(Debug, Clone)]
pub struct ConnectorHandle {
    control: Arc<Control>,
}

impl ConnectorHandle {
    pub(crate) fn new(control: Arc<Control>) -> Self {
        Self { control }
    }

    /// Asks every sink to start a new output unit before the next block.
    ///
    /// Cuts requested before the connector gets to apply them collapse
    /// into one.
    pub fn cut(&self) {
        self.control.cut_generation.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("cut requested");
    }

    /// Ends the current (or next) `transfer` after the block in flight.
    pub fn stop(&self) {
        self.control.stop_requested.store(true, Ordering::Release);
        tracing::debug!("stop requested");
    }

    /// Number of cuts requested through any handle so far.
    pub fn cut_requests(&self) -> u64 {
        self.control.cut_generation()
    }

    /// Returns `true` if a stop is pending and no transfer has consumed it yet.
    pub fn is_stop_requested(&self) -> bool {
        self.control.stop_requested.load(Ordering::Acquire)
    }
}
