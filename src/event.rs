//! Runtime events for monitoring connector health.
//!
//! Events are non-fatal notifications about sink behavior. The connector
//! keeps running after events are emitted - they're for logging/metrics,
//! not error handling. Each connector gets its own callback; there is no
//! process-wide reporter.

use std::sync::Arc;

/// Runtime events emitted by a connector.
///
/// # Example
///
/// ```
/// use stream_connector::ConnectorEvent;
///
/// fn handle_event(event: ConnectorEvent) {
///     match event {
///         ConnectorEvent::SinkWriteFailed { sink_name, error } => {
///             eprintln!("sink '{}' failed: {}", sink_name, error);
///         }
///         ConnectorEvent::SinkReconnected { sink_name } => {
///             eprintln!("sink '{}' is back", sink_name);
///         }
///         other => eprintln!("{:?}", other),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// A sink's `write()` returned an error; it no longer accepts data.
    SinkWriteFailed {
        /// Name of the sink that errored.
        sink_name: String,
        /// Description of the error.
        error: String,
    },

    /// A sink was removed from the single-threaded connector after a failure.
    SinkDetached {
        /// Name of the detached sink.
        sink_name: String,
    },

    /// A failed sink was closed and will be reopened.
    SinkReconnecting {
        /// Name of the sink.
        sink_name: String,
    },

    /// A failed sink was reopened and accepts data again.
    SinkReconnected {
        /// Name of the sink.
        sink_name: String,
    },

    /// Reopening a failed sink did not succeed; another attempt follows.
    SinkReconnectFailed {
        /// Name of the sink.
        sink_name: String,
        /// Description of the error.
        error: String,
    },

    /// A failed sink was closed for good because reconnect is disabled.
    SinkDropped {
        /// Name of the sink.
        sink_name: String,
    },

    /// A sink finished its current output unit and started a new one.
    SinkCut {
        /// Name of the sink.
        sink_name: String,
    },

    /// A sink's `cut()` returned an error. Other sinks are unaffected.
    SinkCutFailed {
        /// Name of the sink.
        sink_name: String,
        /// Description of the error.
        error: String,
    },

    /// The source reported end of stream.
    SourceExhausted {
        /// Total bytes read during the transfer that ended.
        bytes_read: u64,
    },
}

/// Callback type for receiving runtime events.
///
/// Register via `with_event_callback` on either connector.
pub type EventCallback = Arc<dyn Fn(ConnectorEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use stream_connector::{event_callback, ConnectorEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(ConnectorEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Optional callback plus the dispatch helper every component shares.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    callback: Option<EventCallback>,
}

impl EventSink {
    pub(crate) fn new(callback: Option<EventCallback>) -> Self {
        Self { callback }
    }

    pub(crate) fn emit(&self, event: ConnectorEvent) {
        if let Some(ref callback) = self.callback {
            callback(event);
        }
    }
}
