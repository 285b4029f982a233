//! # stream-connector
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Live audio fan-out from one source to many sinks.
//!
//! `stream-connector` reads PCM from a [`Source`] (a capture device, a ring
//! buffer, a test generator) and writes every block to a list of [`Sink`]s
//! (files, sockets, channels, encoder stages). Each sink can fail, reconnect
//! and rotate its output without disturbing the others.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stream_connector::{
//!     ChannelSink, Connector, ConnectorConfig, FileSink, MockSource, MultiThreadedConnector,
//! };
//! use tokio::sync::mpsc;
//!
//! let (tx, _rx) = mpsc::channel::<Vec<u8>>(32);
//!
//! let mut base = Connector::new(MockSource::transcription());
//! base.attach(FileSink::raw("meeting.pcm"))?;
//! base.attach(ChannelSink::new(tx))?;
//!
//! let config = ConnectorConfig::default().with_reconnect(true);
//! let mut connector = MultiThreadedConnector::new(base, config)
//!     .with_event_callback(stream_connector::event_callback(|e| {
//!         tracing::warn!(?e, "connector event");
//!     }));
//!
//! let handle = connector.handle(); // cut() / stop() from any thread
//! connector.open()?;
//! connector.run(0)?;
//! connector.close();
//! # drop(handle);
//! # Ok::<(), stream_connector::ConnectorError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Producer**: the thread calling `transfer` reads one block at a time
//!   into a shared buffer
//! - **Consumers**: one thread per sink writes the block; two condvar gates
//!   keep every consumer on the same block
//! - **Control**: a [`ConnectorHandle`] asks for cuts and stops between
//!   blocks; [`rotation`] drives it from signals or timers
//!
//! A sink that errors is dropped or, with reconnect enabled, reopened on
//! its own thread while the rest keep receiving audio.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod config;
mod connector;
mod error;
mod event;
pub mod format;
pub mod rotation;
mod sink;
pub mod source;
mod stats;

pub use config::{ConnectorConfig, MIN_THREAD_STACK_SIZE};
pub use connector::{Connector, ConnectorHandle, MultiThreadedConnector};
pub use error::{ConnectorError, TransportError};
pub use event::{event_callback, ConnectorEvent, EventCallback};
pub use sink::{
    shared, write_fully, ChannelSink, ConvertingSink, FileFormat, FileSink, Handshake, SharedSink,
    Sink, TcpSink,
};
pub use source::{MockSource, RingSource, Source};
pub use stats::ConnectorStats;

#[cfg(feature = "device")]
pub use source::{default_input_device_name, list_input_devices, DeviceConfig, DeviceSource};
