//! Integration tests for stream-connector.
//!
//! Note: Tests that require actual audio hardware live behind the `device`
//! feature, are marked with `#[ignore]` and should be run manually.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use stream_connector::format::{bytes_to_samples, samples_to_bytes, PcmFormat};
use stream_connector::{
    event_callback, shared, ChannelSink, Connector, ConnectorConfig, ConnectorEvent,
    ConvertingSink, FileSink, MockSource, MultiThreadedConnector, RingSource, Sink, TcpSink,
    TransportError,
};
use tokio::sync::mpsc;

const BLOCK: usize = 1024;
const TIMEOUT: Duration = Duration::from_millis(200);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a [`TestSink`] saw, shared with the test body.
#[derive(Default)]
struct Record {
    blocks: Mutex<Vec<Vec<u8>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    cuts: AtomicUsize,
}

impl Record {
    fn writes(&self) -> usize {
        self.blocks.lock().len()
    }

    /// `MockSource::counting_blocks` fills block i with the byte i; any
    /// other byte in a block fails the test.
    fn block_ids(&self) -> Vec<u8> {
        self.blocks
            .lock()
            .iter()
            .enumerate()
            .map(|(n, b)| {
                assert!(b.iter().all(|&x| x == b[0]), "block {n} is corrupted");
                b[0]
            })
            .collect()
    }

    /// Asserts the sink received exactly the counting blocks `ids`, byte for byte.
    fn assert_counting_blocks(&self, ids: impl IntoIterator<Item = u8>, block_size: usize) {
        let expected: Vec<Vec<u8>> = ids.into_iter().map(|i| vec![i; block_size]).collect();
        let blocks = self.blocks.lock();
        assert_eq!(blocks.len(), expected.len(), "block count");
        for (index, (got, want)) in blocks.iter().zip(&expected).enumerate() {
            assert!(got == want, "block {index} differs from the source");
        }
    }
}

/// A sink with scripted failures.
struct TestSink {
    name: String,
    open: bool,
    writable: bool,
    fail_on_write: Option<usize>,
    failing_reopens: usize,
    fail_close: bool,
    writes: usize,
    record: Arc<Record>,
}

impl TestSink {
    fn new(name: &str) -> (Self, Arc<Record>) {
        let record = Arc::new(Record::default());
        let sink = Self {
            name: name.to_string(),
            open: false,
            writable: true,
            fail_on_write: None,
            failing_reopens: 0,
            fail_close: false,
            writes: 0,
            record: record.clone(),
        };
        (sink, record)
    }

    fn failing_at(name: &str, write_index: usize) -> (Self, Arc<Record>) {
        let (mut sink, record) = Self::new(name);
        sink.fail_on_write = Some(write_index);
        (sink, record)
    }
}

impl Sink for TestSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let attempt = self.record.opens.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 && attempt <= self.failing_reopens {
            return Err(TransportError::custom("server unavailable"));
        }
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn can_write(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        if self.open && !self.writable {
            std::thread::sleep(timeout);
        }
        Ok(self.open && self.writable)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let index = self.writes;
        self.writes += 1;
        if self.fail_on_write == Some(index) {
            return Err(TransportError::custom("connection reset"));
        }
        self.record.blocks.lock().push(data.to_vec());
        Ok(data.len())
    }

    fn cut(&mut self) -> Result<(), TransportError> {
        self.record.cuts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.record.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(TransportError::custom("close failed"));
        }
        Ok(())
    }
}

fn collect_events() -> (stream_connector::EventCallback, Arc<Mutex<Vec<ConnectorEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    (event_callback(move |e| seen.lock().push(e)), events)
}

fn threaded(blocks: usize, sinks: Vec<TestSink>, config: ConnectorConfig) -> MultiThreadedConnector {
    let mut base = Connector::new(MockSource::counting_blocks(BLOCK, blocks));
    for sink in sinks {
        base.attach(sink).unwrap();
    }
    MultiThreadedConnector::new(base, config)
}

#[test]
fn test_two_sinks_second_fails_on_fifth_block() {
    init_tracing();
    let (first, first_record) = TestSink::new("first");
    let (second, second_record) = TestSink::failing_at("second", 4);

    let mut connector = threaded(10, vec![first, second], ConnectorConfig::default());
    connector.open().unwrap();

    assert_eq!(connector.transfer(0, BLOCK, TIMEOUT).unwrap(), 10240);
    assert_eq!(first_record.writes(), 10);
    assert_eq!(second_record.writes(), 4);
    connector.close();

    first_record.assert_counting_blocks(0..10, BLOCK);
    second_record.assert_counting_blocks(0..4, BLOCK);
}

#[test]
fn test_failure_isolation_across_three_sinks() {
    init_tracing();
    let (a, a_record) = TestSink::new("a");
    let (b, b_record) = TestSink::failing_at("b", 3);
    let (c, c_record) = TestSink::new("c");
    let (callback, events) = collect_events();

    let mut connector = threaded(12, vec![a, b, c], ConnectorConfig::default())
        .with_event_callback(callback);
    connector.open().unwrap();
    connector.transfer(0, BLOCK, TIMEOUT).unwrap();
    connector.close();

    a_record.assert_counting_blocks(0..12, BLOCK);
    c_record.assert_counting_blocks(0..12, BLOCK);
    b_record.assert_counting_blocks(0..3, BLOCK);

    let events = events.lock();
    assert!(events.contains(&ConnectorEvent::SinkWriteFailed {
        sink_name: "b".to_string(),
        error: "connection reset".to_string(),
    }));
    assert!(events.contains(&ConnectorEvent::SinkDropped {
        sink_name: "b".to_string()
    }));
    assert!(events.contains(&ConnectorEvent::SourceExhausted { bytes_read: 12 * 1024 }));
}

#[test]
fn test_unwritable_sink_does_not_starve_others() {
    init_tracing();
    let (fast, fast_record) = TestSink::new("fast");
    let (mut stuck, stuck_record) = TestSink::new("stuck");
    stuck.writable = false;

    let mut connector = threaded(50, vec![fast, stuck], ConnectorConfig::default());
    connector.open().unwrap();

    let started = Instant::now();
    assert_eq!(connector.transfer(0, BLOCK, TIMEOUT).unwrap(), 50 * 1024);
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(fast_record.writes(), 50);
    assert_eq!(stuck_record.writes(), 0);
    assert!(connector.is_accepting(1));
    connector.close();
}

#[test]
fn test_stalled_tcp_peer_does_not_starve_others() {
    init_tracing();
    const BIG_BLOCK: usize = 64 * 1024;
    const BLOCKS: usize = 256;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let peer = std::thread::spawn(move || {
        // Accepts, then never reads
        let (conn, _) = listener.accept().unwrap();
        let _ = release_rx.recv();
        drop(conn);
    });

    let (healthy, record) = TestSink::new("healthy");
    let mut base = Connector::new(MockSource::counting_blocks(BIG_BLOCK, BLOCKS));
    base.attach(healthy).unwrap();
    base.attach(TcpSink::new(addr.to_string()).with_write_timeout(Duration::from_millis(50)))
        .unwrap();
    let mut connector = MultiThreadedConnector::new(base, ConnectorConfig::default());
    connector.open().unwrap();

    let started = Instant::now();
    let moved = connector.transfer(0, BIG_BLOCK, TIMEOUT).unwrap();
    let elapsed = started.elapsed();
    connector.close();
    release_tx.send(()).unwrap();
    peer.join().unwrap();

    assert_eq!(moved, (BIG_BLOCK * BLOCKS) as u64);
    assert!(elapsed < Duration::from_secs(30), "transfer took {elapsed:?}");
    record.assert_counting_blocks((0..BLOCKS).map(|i| i as u8), BIG_BLOCK);
}

#[test]
fn test_reconnect_skips_blocks_then_resumes() {
    init_tracing();
    let (mut flaky, record) = TestSink::failing_at("flaky", 2);
    flaky.failing_reopens = 1;
    let (callback, events) = collect_events();

    let mut base = Connector::new(
        MockSource::counting_blocks(BLOCK, 40).with_read_delay(Duration::from_millis(5)),
    );
    base.attach(flaky).unwrap();
    let config = ConnectorConfig::default()
        .with_reconnect(true)
        .with_reconnect_delay(Duration::from_millis(20));
    let mut connector = MultiThreadedConnector::new(base, config).with_event_callback(callback);
    connector.open().unwrap();

    assert_eq!(connector.transfer(0, BLOCK, TIMEOUT).unwrap(), 40 * 1024);
    connector.close();

    let ids = record.block_ids();
    assert_eq!(&ids[..2], &[0, 1]);
    assert!(!ids.contains(&2));
    assert_eq!(ids.last(), Some(&39));
    // Blocks arrive in order even across the gap
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    let events = events.lock();
    let reconnect_events: Vec<_> = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                ConnectorEvent::SinkReconnectFailed { .. } | ConnectorEvent::SinkReconnected { .. }
            )
        })
        .collect();
    assert_eq!(reconnect_events.len(), 2);
    assert!(matches!(
        reconnect_events[0],
        ConnectorEvent::SinkReconnectFailed { .. }
    ));
    assert_eq!(connector.stats().reconnects, 1);
}

#[test]
fn test_cut_is_idempotent_until_applied() {
    init_tracing();
    let (sink, record) = TestSink::new("a");
    let mut connector = threaded(6, vec![sink], ConnectorConfig::default());
    let handle = connector.handle();
    connector.open().unwrap();

    handle.cut();
    handle.cut();
    connector.cut();
    connector.transfer(2 * 1024, BLOCK, TIMEOUT).unwrap();
    assert_eq!(record.cuts.load(Ordering::SeqCst), 1);

    handle.cut();
    connector.transfer(0, BLOCK, TIMEOUT).unwrap();
    assert_eq!(record.cuts.load(Ordering::SeqCst), 2);
    connector.close();
}

#[test]
fn test_cut_with_no_sinks_is_noop() {
    let mut connector = threaded(2, Vec::new(), ConnectorConfig::default());
    connector.cut();
    connector.open().unwrap();
    connector.handle().cut();
    connector.cut();
    assert_eq!(connector.transfer(0, BLOCK, TIMEOUT).unwrap(), 2048);
    assert_eq!(connector.stats().cuts, 0);
    connector.close();
}

#[test]
fn test_close_completes_when_sink_close_errors() {
    init_tracing();
    let (mut bad, bad_record) = TestSink::new("bad");
    bad.fail_close = true;
    let (good, good_record) = TestSink::new("good");

    let mut connector = threaded(3, vec![bad, good], ConnectorConfig::default());
    connector.open().unwrap();
    connector.transfer(0, BLOCK, TIMEOUT).unwrap();
    connector.close();

    assert!(!connector.is_open());
    assert_eq!(bad_record.closes.load(Ordering::SeqCst), 1);
    assert_eq!(good_record.closes.load(Ordering::SeqCst), 1);

    // Reopen after a messy close works
    connector.open().unwrap();
    assert!(connector.is_open());
    connector.close();
}

#[test]
fn test_file_rotation_end_to_end() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("show.pcm");

    let mut base = Connector::new(MockSource::counting_blocks(BLOCK, 8));
    base.attach(FileSink::raw(&path)).unwrap();
    let mut connector = MultiThreadedConnector::new(base, ConnectorConfig::default());
    let handle = connector.handle();
    connector.open().unwrap();

    assert_eq!(connector.transfer(4 * 1024, BLOCK, TIMEOUT).unwrap(), 4096);
    handle.cut();
    assert_eq!(connector.transfer(0, BLOCK, TIMEOUT).unwrap(), 4096);
    connector.close();

    let mut archives: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|p| p != &path)
        .collect();
    assert_eq!(archives.len(), 1);
    let archive = archives.pop().unwrap();

    let first = std::fs::read(&archive).unwrap();
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first.len(), 4096);
    assert_eq!(second.len(), 4096);
    assert_eq!(first[0], 0);
    assert_eq!(second[0], 4);
    assert_eq!(connector.stats().cuts, 1);
}

#[test]
fn test_failed_rotation_keeps_sink_accepting() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("show.pcm");
    let (callback, events) = collect_events();

    let mut base = Connector::new(MockSource::counting_blocks(BLOCK, 8));
    base.attach(FileSink::raw(&path).with_archive_dir(dir.path().join("missing")))
        .unwrap();
    let config = ConnectorConfig::default().with_reconnect(true);
    let mut connector = MultiThreadedConnector::new(base, config).with_event_callback(callback);
    let handle = connector.handle();
    connector.open().unwrap();

    assert_eq!(connector.transfer(4 * 1024, BLOCK, TIMEOUT).unwrap(), 4096);
    handle.cut();
    assert_eq!(connector.transfer(0, BLOCK, TIMEOUT).unwrap(), 4096);
    assert!(connector.is_accepting(0));
    connector.close();

    // Nothing was truncated: all eight blocks are in the unrotated file
    let data = std::fs::read(&path).unwrap();
    let expected: Vec<u8> = (0..8u8).flat_map(|i| vec![i; BLOCK]).collect();
    assert!(data == expected, "file holds {} bytes", data.len());

    assert_eq!(connector.stats().cuts, 0);
    assert_eq!(connector.stats().reconnects, 0);
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, ConnectorEvent::SinkCutFailed { .. })));
}

#[test]
fn test_channel_sink_behind_threaded_connector() {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);

    let mut base = Connector::new(MockSource::counting_blocks(BLOCK, 10));
    base.attach(ChannelSink::new(tx)).unwrap();
    let mut connector = MultiThreadedConnector::new(base, ConnectorConfig::default());
    connector.open().unwrap();
    connector.transfer(0, BLOCK, TIMEOUT).unwrap();
    connector.close();

    let mut ids = Vec::new();
    while let Ok(block) = rx.try_recv() {
        assert_eq!(block.len(), BLOCK);
        ids.push(block[0]);
    }
    assert_eq!(ids, (0..10).collect::<Vec<u8>>());
}

#[test]
fn test_ring_source_through_converting_sink() {
    let mut mock = MockSource::new(16000, 2);
    mock.add_samples(&[100, 200, 300, 400, 500, 600]);
    let source = RingSource::new(mock.into_ring_buffer());

    let (inner, record) = TestSink::new("mono");
    let converting =
        ConvertingSink::new(inner, PcmFormat::new(16000, 2), PcmFormat::new(16000, 1)).unwrap();

    let mut connector = Connector::new(source);
    connector.attach(converting).unwrap();
    connector.open().unwrap();
    // Odd block size splits frames across blocks
    connector.transfer(0, 6, TIMEOUT).unwrap();
    connector.close();

    let out: Vec<u8> = record.blocks.lock().concat();
    assert_eq!(bytes_to_samples(&out), vec![150, 350, 550]);
}

#[test]
fn test_shared_sink_observed_after_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.pcm");
    let sink = shared(FileSink::raw(&path));

    let mut connector = Connector::new(MockSource::from_bytes(samples_to_bytes(&[1, 2, 3])));
    connector.attach_shared(sink.clone()).unwrap();
    connector.open().unwrap();
    assert_eq!(connector.transfer(0, 64, TIMEOUT).unwrap(), 6);
    connector.close();

    assert!(!sink.lock().is_open());
    assert_eq!(std::fs::read(&path).unwrap(), samples_to_bytes(&[1, 2, 3]));
}

#[test]
fn test_stop_from_another_thread() {
    let (sink, record) = TestSink::new("a");
    let mut base = Connector::new(
        MockSource::counting_blocks(BLOCK, 1000).with_read_delay(Duration::from_millis(2)),
    );
    base.attach(sink).unwrap();
    let mut connector = MultiThreadedConnector::new(base, ConnectorConfig::default());
    connector.open().unwrap();

    let handle = connector.handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
    });

    let moved = connector.transfer(0, BLOCK, TIMEOUT).unwrap();
    stopper.join().unwrap();
    connector.close();

    assert!(moved < 1000 * 1024);
    assert_eq!(moved as usize, record.writes() * BLOCK);
}
