//! Connector with one consumer thread per sink.
//!
//! The producer (the thread calling `transfer`) reads a block into a shared
//! buffer and releases all accepting consumers through the start gate. It
//! then waits on the done gate until every released consumer has finished
//! with the block, so block *i* is fully distributed before block *i+1* is
//! read. A consumer that fails is either dropped or reopened in the
//! background; either way the producer stops waiting for it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use super::{block_len, close_sink, cut_sink, Connector, ConnectorHandle};
use crate::config::ConnectorConfig;
use crate::event::EventSink;
use crate::sink::{write_fully, Sink};
use crate::stats::StatsState;
use crate::{ConnectorError, ConnectorEvent, ConnectorStats, EventCallback, SharedSink, Source};

/// Per-thread state machine. Only the producer sets `Running`; only the
/// owning consumer sets `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Phase {
    Running = 0,
    Done = 1,
    Terminate = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Done,
            _ => Self::Terminate,
        }
    }
}

/// Bookkeeping for one consumer thread, index-aligned with the sink list.
struct ThreadData {
    index: usize,
    sink: SharedSink,
    name: String,
    phase: AtomicU8,
    accepting: AtomicBool,
    cut_requested: AtomicBool,
}

impl ThreadData {
    fn new(index: usize, sink: SharedSink) -> Self {
        let name = sink.lock().name().to_string();
        Self {
            index,
            sink,
            name,
            phase: AtomicU8::new(Phase::Done as u8),
            accepting: AtomicBool::new(true),
            cut_requested: AtomicBool::new(false),
        }
    }

    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

/// State shared by the producer and all consumers for one open/close cycle.
struct Shared {
    running: AtomicBool,
    start_lock: Mutex<()>,
    start_cv: Condvar,
    done_lock: Mutex<()>,
    done_cv: Condvar,
    /// Current block; its length is the block length.
    buffer: RwLock<Vec<u8>>,
    threads: Vec<ThreadData>,
    reconnect: bool,
    reconnect_delay: Duration,
    events: EventSink,
    stats: Arc<StatsState>,
}

impl Shared {
    /// Releases every accepting consumer on the current block and waits
    /// until all of them are done with it.
    fn dispatch(&self, cut: bool) {
        let start = self.start_lock.lock();
        for data in &self.threads {
            if cut {
                data.cut_requested.store(true, Ordering::Release);
            }
            if data.is_accepting() {
                data.set_phase(Phase::Running);
            }
        }
        self.start_cv.notify_all();

        // Taken before the start lock is released so no Done notification
        // can slip in between.
        let mut done = self.done_lock.lock();
        drop(start);

        while self.threads.iter().any(|t| t.phase() == Phase::Running) {
            self.done_cv.wait(&mut done);
        }
    }

    /// Tells every consumer to exit and wakes those waiting.
    fn terminate(&self) {
        self.running.store(false, Ordering::Release);
        let _start = self.start_lock.lock();
        for data in &self.threads {
            data.set_phase(Phase::Terminate);
        }
        self.start_cv.notify_all();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Sleeps for the reconnect delay, returning early with `false` if the
    /// connector is closing.
    fn backoff(&self) -> bool {
        let deadline = Instant::now() + self.reconnect_delay;
        let mut guard = self.start_lock.lock();
        while self.is_running() && Instant::now() < deadline {
            self.start_cv.wait_until(&mut guard, deadline);
        }
        self.is_running()
    }
}

/// Marks the owning thread `Done` when dropped, also on unwind, so the
/// producer never waits on a dead consumer.
struct DoneGuard<'a> {
    shared: &'a Shared,
    data: &'a ThreadData,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.data.accepting.store(false, Ordering::Release);
        }
        let _done = self.shared.done_lock.lock();
        self.data.set_phase(Phase::Done);
        self.shared.done_cv.notify_all();
    }
}

/// Multi-threaded connector: one consumer thread per sink.
///
/// Wraps a [`Connector`] that holds the source and sink list. Between
/// `open()` and `close()` the sink list is frozen; `attach` and `detach`
/// return [`ConnectorError::Busy`].
///
/// A failed sink never stops the transfer. With
/// [`reconnect`](ConnectorConfig::reconnect) enabled its thread closes it,
/// waits [`reconnect_delay`](ConnectorConfig::reconnect_delay) and reopens
/// it, retrying until it succeeds or the connector closes. Blocks produced
/// meanwhile are not replayed.
///
/// # Example
///
/// ```
/// use stream_connector::{
///     Connector, ConnectorConfig, MockSource, MultiThreadedConnector, Sink, TransportError,
/// };
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
/// let mut base = Connector::new(MockSource::counting_blocks(1024, 10));
/// base.attach(Discard(false))?;
/// base.attach(Discard(false))?;
///
/// let mut connector = MultiThreadedConnector::new(base, ConnectorConfig::default());
/// connector.open()?;
/// assert_eq!(connector.transfer(0, 1024, Duration::from_millis(100))?, 10240);
/// connector.close();
/// # Ok::<(), stream_connector::ConnectorError>(())
/// ```
pub struct MultiThreadedConnector {
    base: Connector,
    config: ConnectorConfig,
    shared: Option<Arc<Shared>>,
    workers: Vec<JoinHandle<()>>,
}

impl MultiThreadedConnector {
    /// Wraps `base`. The connector starts closed.
    pub fn new(base: Connector, config: ConnectorConfig) -> Self {
        Self {
            base,
            config,
            shared: None,
            workers: Vec::new(),
        }
    }

    /// Registers a callback for runtime events.
    ///
    /// Consumer threads call it directly, so it must be cheap and must not
    /// block.
    #[must_use]
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.base.events = EventSink::new(Some(callback));
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Returns a handle that can request cuts and stops from other threads.
    pub fn handle(&self) -> ConnectorHandle {
        self.base.handle()
    }

    /// Returns a snapshot of the transfer counters.
    pub fn stats(&self) -> ConnectorStats {
        self.base.stats()
    }

    /// Returns `true` while consumer threads are running.
    pub fn is_open(&self) -> bool {
        self.shared.is_some()
    }

    /// The source blocks are read from.
    pub fn source(&self) -> &dyn Source {
        self.base.source()
    }

    /// Attached sinks in index order.
    pub fn sinks(&self) -> &[SharedSink] {
        self.base.sinks()
    }

    /// Number of attached sinks.
    pub fn sink_count(&self) -> usize {
        self.base.sink_count()
    }

    /// Returns `true` if the sink at `index` currently takes data.
    ///
    /// Always `false` while closed or for an unknown index.
    pub fn is_accepting(&self, index: usize) -> bool {
        self.shared
            .as_ref()
            .and_then(|shared| shared.threads.get(index))
            .is_some_and(ThreadData::is_accepting)
    }

    /// Attaches a sink while closed.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::Busy`] while open.
    pub fn attach<S: Sink + 'static>(&mut self, sink: S) -> Result<usize, ConnectorError> {
        if self.is_open() {
            return Err(ConnectorError::Busy);
        }
        self.base.attach(sink)
    }

    /// Attaches a shared sink while closed.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::Busy`] while open.
    pub fn attach_shared(&mut self, sink: SharedSink) -> Result<usize, ConnectorError> {
        if self.is_open() {
            return Err(ConnectorError::Busy);
        }
        self.base.attach_shared(sink)
    }

    /// Detaches a sink while closed.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::Busy`] while open, [`ConnectorError::NoSuchSink`]
    /// for a bad index.
    pub fn detach(&mut self, index: usize) -> Result<SharedSink, ConnectorError> {
        if self.is_open() {
            return Err(ConnectorError::Busy);
        }
        self.base.detach(index)
    }

    /// Opens the source and sinks, then starts one consumer thread per sink.
    ///
    /// # Errors
    ///
    /// Everything [`Connector::open`] returns, plus
    /// [`ConnectorError::ThreadSpawn`] if a thread cannot be started. In
    /// that case threads already started are stopped and everything is
    /// closed again.
    pub fn open(&mut self) -> Result<(), ConnectorError> {
        if self.is_open() {
            return Err(ConnectorError::AlreadyOpen);
        }
        self.base.open()?;

        let threads = self
            .base
            .sinks
            .iter()
            .enumerate()
            .map(|(index, sink)| ThreadData::new(index, sink.clone()))
            .collect();
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            start_lock: Mutex::new(()),
            start_cv: Condvar::new(),
            done_lock: Mutex::new(()),
            done_cv: Condvar::new(),
            buffer: RwLock::new(Vec::with_capacity(self.config.block_size)),
            threads,
            reconnect: self.config.reconnect,
            reconnect_delay: self.config.reconnect_delay,
            events: self.base.events.clone(),
            stats: self.base.stats.clone(),
        });

        let stack_size = self.config.effective_stack_size();
        for index in 0..shared.threads.len() {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("sink-{index}"))
                .stack_size(stack_size)
                .spawn(move || consume(&worker_shared, index));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(source) => {
                    let sink_name = shared.threads[index].name.clone();
                    tracing::error!(sink = %sink_name, error = %source, "failed to spawn consumer thread");
                    shared.terminate();
                    self.join_workers();
                    self.base.close();
                    return Err(ConnectorError::ThreadSpawn { sink_name, source });
                }
            }
        }

        tracing::info!(threads = shared.threads.len(), stack_size, "consumer threads started");
        self.shared = Some(shared);
        Ok(())
    }

    /// Moves up to `bytes` bytes (`0` for no limit) from the source to all
    /// accepting sinks, in blocks of at most `block_size`.
    ///
    /// Stops on end of stream, when the source is not readable within
    /// `timeout`, or on a [`ConnectorHandle::stop`]. Failed sinks do not end
    /// the transfer. Returns the number of bytes read from the source.
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
        let Some(shared) = self.shared.clone() else {
            return Err(ConnectorError::NotOpen);
        };

        let mut total = 0u64;
        loop {
            if self.base.control.take_stop() {
                tracing::debug!(total, "transfer stopped on request");
                break;
            }
            let Some(want) = block_len(bytes, total, block_size) else {
                break;
            };

            let n = {
                // Every consumer finished the previous block in dispatch()
                let mut buffer = shared.buffer.write();
                buffer.resize(want, 0);
                let read = self.base.read_block(&mut buffer, timeout);
                match read {
                    Ok(Some(n)) => {
                        buffer.truncate(n);
                        n
                    }
                    Ok(None) => break,
                    Err(e) => {
                        buffer.clear();
                        return Err(e);
                    }
                }
            };
            if n == 0 {
                self.base
                    .events
                    .emit(ConnectorEvent::SourceExhausted { bytes_read: total });
                tracing::debug!(total, "source exhausted");
                break;
            }

            total += n as u64;
            self.base.stats.record_block(n);
            let cut = self.base.take_cut_request();
            shared.dispatch(cut);
        }
        Ok(total)
    }

    /// Like [`transfer`](Self::transfer), using the configured block size
    /// and poll timeout.
    ///
    /// # Errors
    ///
    /// See [`transfer`](Self::transfer).
    pub fn run(&mut self, bytes: u64) -> Result<u64, ConnectorError> {
        self.transfer(bytes, self.config.block_size, self.config.poll_timeout)
    }

    /// Requests a cut on every sink.
    ///
    /// While open, each consumer performs it at the start of its next
    /// block; repeated requests before that collapse into one. While
    /// closed, open sinks are cut immediately.
    pub fn cut(&mut self) {
        match self.shared {
            Some(ref shared) => {
                for data in &shared.threads {
                    data.cut_requested.store(true, Ordering::Release);
                }
            }
            None => self.base.cut(),
        }
    }

    /// Stops and joins every consumer thread, then closes the source and
    /// sinks. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.terminate();
            self.join_workers();
            tracing::info!("consumer threads stopped");
        }
        self.base.close();
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("sink-?").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "consumer thread panicked");
            }
        }
    }
}

impl Drop for MultiThreadedConnector {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer thread body.
fn consume(shared: &Shared, index: usize) {
    let data = &shared.threads[index];
    tracing::debug!(sink = %data.name, index = data.index, "consumer started");

    while wait_for_block(shared, data) {
        {
            let _done = DoneGuard { shared, data };
            process_block(shared, data);
        }
        if !data.is_accepting() {
            recover(shared, data);
        }
    }

    tracing::debug!(sink = %data.name, "consumer exiting");
}

/// Blocks until the producer releases this thread. Returns `false` when the
/// connector is closing.
fn wait_for_block(shared: &Shared, data: &ThreadData) -> bool {
    let mut guard = shared.start_lock.lock();
    loop {
        if !shared.is_running() || data.phase() == Phase::Terminate {
            return false;
        }
        if data.phase() == Phase::Running {
            return true;
        }
        shared.start_cv.wait(&mut guard);
    }
}

fn process_block(shared: &Shared, data: &ThreadData) {
    let block = shared.buffer.read();
    let mut sink = data.sink.lock();

    if data.cut_requested.swap(false, Ordering::AcqRel) {
        cut_sink(&mut *sink, &shared.events, &shared.stats);
    }
    if !data.is_accepting() {
        return;
    }

    let result = match sink.can_write(Duration::ZERO) {
        Ok(true) => write_fully(&mut *sink, &block, Duration::ZERO).map(Some),
        Ok(false) => Ok(None),
        Err(e) => Err(e),
    };
    match result {
        Ok(Some(n)) if n < block.len() => {
            tracing::debug!(sink = %data.name, written = n, len = block.len(), "partial block");
        }
        Ok(Some(_)) => {
            tracing::trace!(sink = %data.name, len = block.len(), "block written");
        }
        Ok(None) => {
            tracing::trace!(sink = %data.name, "sink not writable, block skipped");
        }
        Err(e) => {
            tracing::warn!(sink = %data.name, error = %e, "sink write failed");
            data.accepting.store(false, Ordering::Release);
            shared.stats.sink_failures.fetch_add(1, Ordering::Relaxed);
            shared.events.emit(ConnectorEvent::SinkWriteFailed {
                sink_name: data.name.clone(),
                error: e.to_string(),
            });
        }
    }
}

/// Runs after a failure: reopen in a loop with reconnect, otherwise close
/// the sink once and leave the thread idle.
fn recover(shared: &Shared, data: &ThreadData) {
    if !shared.reconnect {
        let mut sink = data.sink.lock();
        if sink.is_open() {
            close_sink(&mut *sink);
            tracing::info!(sink = %data.name, "sink dropped");
            shared.events.emit(ConnectorEvent::SinkDropped {
                sink_name: data.name.clone(),
            });
        }
        return;
    }

    loop {
        tracing::info!(sink = %data.name, delay = ?shared.reconnect_delay, "reconnecting sink");
        shared.events.emit(ConnectorEvent::SinkReconnecting {
            sink_name: data.name.clone(),
        });
        close_sink(&mut *data.sink.lock());

        if !shared.backoff() {
            return;
        }

        let reopened = data.sink.lock().open();
        match reopened {
            Ok(()) => {
                {
                    let _start = shared.start_lock.lock();
                    data.accepting.store(true, Ordering::Release);
                }
                shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                tracing::info!(sink = %data.name, "sink reconnected");
                shared.events.emit(ConnectorEvent::SinkReconnected {
                    sink_name: data.name.clone(),
                });
                return;
            }
            Err(e) => {
                tracing::warn!(sink = %data.name, error = %e, "sink reopen failed");
                shared.events.emit(ConnectorEvent::SinkReconnectFailed {
                    sink_name: data.name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
}
