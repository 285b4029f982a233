//! Error types for stream-connector.
//!
//! Errors are split into two categories:
//! - **Connector errors** ([`ConnectorError`]): setup failures and source
//!   failures, returned to whoever drives the connector
//! - **Transport errors** ([`TransportError`]): I/O failures local to one
//!   source or sink. Sink-side transport errors never reach the producer;
//!   they are surfaced via [`EventCallback`](crate::EventCallback) instead.

use std::path::PathBuf;

/// Errors returned by [`Connector`](crate::Connector) and
/// [`MultiThreadedConnector`](crate::MultiThreadedConnector).
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// `open()` was called on a connector that is already open.
    #[error("connector is already open")]
    AlreadyOpen,

    /// An operation that needs an open connector was called on a closed one.
    #[error("connector is not open")]
    NotOpen,

    /// The sink list cannot change while consumer threads are running.
    #[error("cannot attach or detach sinks while the connector is open")]
    Busy,

    /// No sink exists at the given index.
    #[error("no sink at index {index}")]
    NoSuchSink {
        /// The index that was requested.
        index: usize,
    },

    /// The source could not be opened.
    #[error("source '{source_name}' failed to open: {reason}")]
    SourceOpenFailed {
        /// Name of the source.
        source_name: String,
        /// Why the source failed to open.
        reason: String,
    },

    /// A sink could not be opened.
    #[error("sink '{sink_name}' failed to open: {reason}")]
    SinkOpenFailed {
        /// Name of the sink that failed.
        sink_name: String,
        /// Why the sink failed to open.
        reason: String,
    },

    /// A consumer thread could not be started.
    #[error("failed to spawn consumer thread for sink '{sink_name}': {source}")]
    ThreadSpawn {
        /// Name of the sink the thread would have served.
        sink_name: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The requested block size was zero.
    #[error("block size must be greater than zero")]
    InvalidBlockSize,

    /// The source failed while polling or reading.
    #[error("source error: {0}")]
    Source(#[source] TransportError),
}

/// Errors raised by a [`Source`](crate::Source) or [`Sink`](crate::Sink)
/// implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint was used while closed.
    #[error("endpoint is not open")]
    NotOpen,

    /// Generic I/O failure with a short description of the operation.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// File I/O error.
    #[error("file error: {path}: {source}")]
    File {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The receiving side of a channel was dropped.
    #[error("channel closed")]
    ChannelClosed,

    /// A protocol login was rejected or malformed.
    #[error("handshake failed: {reason}")]
    Handshake {
        /// What the remote end answered, or why the exchange failed.
        reason: String,
    },

    /// The data could not be interpreted in the configured PCM format.
    #[error("format error: {reason}")]
    Format {
        /// Description of the mismatch.
        reason: String,
    },

    /// Custom error for user-implemented endpoints.
    #[error("{0}")]
    Custom(String),
}

impl TransportError {
    /// Creates a custom transport error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Wraps an I/O error with a description of the failed operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a file error for the given path.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Creates a handshake error.
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }
}
