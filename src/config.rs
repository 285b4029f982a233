//! Configuration types for connectors.

use std::time::Duration;

/// Smallest stack a consumer thread is given.
///
/// Encoder sinks call deep into codec libraries; anything below this risks
/// stack exhaustion.
pub const MIN_THREAD_STACK_SIZE: usize = 128 * 1024;

/// Configuration for connector behavior.
///
/// Use [`ConnectorConfig::default()`] for sensible defaults, or customize as needed.
///
/// # Example
///
/// ```
/// use stream_connector::ConnectorConfig;
/// use std::time::Duration;
///
/// let config = ConnectorConfig::default()
///     .with_reconnect(true)
///     .with_reconnect_delay(Duration::from_millis(250));
/// assert!(config.reconnect);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Maximum number of bytes read from the source per block.
    ///
    /// Default: 4096
    pub block_size: usize,

    /// Upper bound on each source/sink readiness poll.
    ///
    /// Default: 1s
    pub poll_timeout: Duration,

    /// Close and reopen a failed sink instead of dropping it.
    ///
    /// Only consulted by [`MultiThreadedConnector`](crate::MultiThreadedConnector).
    /// Default: `false`
    pub reconnect: bool,

    /// Pause between closing a failed sink and reopening it.
    ///
    /// Default: 1s
    pub reconnect_delay: Duration,

    /// Stack size requested for each consumer thread.
    ///
    /// Values below [`MIN_THREAD_STACK_SIZE`] are raised to it.
    /// Default: 256 KiB
    pub thread_stack_size: usize,
}

impl ConnectorConfig {
    /// Sets the block size.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the readiness poll timeout.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Enables or disables sink reconnection.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the pause between a sink's close and reopen.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the consumer thread stack size.
    #[must_use]
    pub fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Returns the stack size actually used for consumer threads.
    #[must_use]
    pub fn effective_stack_size(&self) -> usize {
        self.thread_stack_size.max(MIN_THREAD_STACK_SIZE)
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            poll_timeout: Duration::from_secs(1),
            reconnect: false,
            reconnect_delay: Duration::from_secs(1),
            thread_stack_size: 256 * 1024,
        }
    }
}
