//! Transfer statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a connector's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorStats {
    /// Blocks read from the source.
    pub blocks_read: u64,
    /// Bytes read from the source.
    pub bytes_read: u64,
    /// Sink write failures.
    pub sink_failures: u64,
    /// Successful sink reopens after a failure.
    pub reconnects: u64,
    /// Completed sink cuts.
    pub cuts: u64,
}

/// Counters shared between the producer and consumer threads.
#[derive(Debug, Default)]
pub(crate) struct StatsState {
    pub blocks_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub sink_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub cuts: AtomicU64,
}

impl StatsState {
    pub fn record_block(&self, bytes: usize) {
        self.blocks_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectorStats {
        ConnectorStats {
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            cuts: self.cuts.load(Ordering::Relaxed),
        }
    }
}
