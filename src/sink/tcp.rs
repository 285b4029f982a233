//! TCP stream sink with an optional login exchange.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::sink::Sink;
use crate::TransportError;

/// Default timeout for establishing the connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default blocking limit for a single `write` call.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on how much of the login reply is read.
const MAX_REPLY_LEN: usize = 1024;

/// Login exchange performed right after connecting.
///
/// The sink sends `request` and requires the server's reply to start with
/// `expect_prefix` before it accepts any audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    request: Vec<u8>,
    expect_prefix: Vec<u8>,
}

impl Handshake {
    /// Creates a login exchange.
    pub fn new(request: impl Into<Vec<u8>>, expect_prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            request: request.into(),
            expect_prefix: expect_prefix.into(),
        }
    }

    fn perform(&self, stream: &mut TcpStream, timeout: Duration) -> Result<(), TransportError> {
        stream
            .write_all(&self.request)
            .map_err(|e| TransportError::io("send login request", e))?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| TransportError::io("set read timeout", e))?;

        let wanted = self.expect_prefix.len().min(MAX_REPLY_LEN);
        let mut reply = Vec::with_capacity(wanted);
        let mut buf = [0u8; 256];
        while reply.len() < wanted {
            let n = stream
                .read(&mut buf)
                .map_err(|e| TransportError::io("read login reply", e))?;
            if n == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..n]);
        }

        if reply.starts_with(&self.expect_prefix) {
            Ok(())
        } else {
            Err(TransportError::handshake(
                String::from_utf8_lossy(&reply).trim_end().to_string(),
            ))
        }
    }
}

/// A sink that writes to a TCP connection.
///
/// `write` blocks for at most the write timeout; a timed-out write reports
/// zero bytes taken rather than an error. After such a stall `can_write`
/// reports the sink unwritable for one more write timeout, so a peer that
/// stops reading costs each block at most one blocking write.
///
/// # Example
///
/// ```no_run
/// use stream_connector::{Handshake, TcpSink};
///
/// let sink = TcpSink::new("127.0.0.1:8000")
///     .with_handshake(Handshake::new("SOURCE /live ICE/1.0\r\n\r\n", "HTTP/1.0 200"));
/// ```
pub struct TcpSink {
    name: String,
    addr: String,
    connect_timeout: Duration,
    write_timeout: Duration,
    handshake: Option<Handshake>,
    stream: Option<TcpStream>,
    /// End of the backoff that follows a timed-out write.
    stalled_until: Option<Instant>,
}

impl TcpSink {
    /// Creates a sink for `addr` (anything `ToSocketAddrs` accepts as a string).
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            name: format!("tcp:{addr}"),
            addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            handshake: None,
            stream: None,
            stalled_until: None,
        }
    }

    /// Requires a login exchange after every connect.
    #[must_use]
    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Sets the connect timeout, also used for the login reply.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets how long one `write` may block.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    fn connect(&self) -> Result<TcpStream, TransportError> {
        let addrs = self
            .addr
            .to_socket_addrs()
            .map_err(|e| TransportError::io(format!("resolve {}", self.addr), e))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(TransportError::io(
            format!("connect {}", self.addr),
            last_err.unwrap_or_else(|| {
                std::io::Error::new(ErrorKind::NotFound, "address resolved to nothing")
            }),
        ))
    }
}

impl Sink for TcpSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let mut stream = self.connect()?;
        stream
            .set_write_timeout(Some(self.write_timeout))
            .map_err(|e| TransportError::io("set write timeout", e))?;
        // Audio blocks are already batched
        let _ = stream.set_nodelay(true);

        if let Some(ref handshake) = self.handshake {
            handshake.perform(&mut stream, self.connect_timeout)?;
        }

        tracing::info!(addr = %self.addr, "tcp sink connected");
        self.stream = Some(stream);
        self.stalled_until = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn can_write(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        if self.stream.is_none() {
            return Ok(false);
        }
        let Some(until) = self.stalled_until else {
            return Ok(true);
        };
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining > timeout {
            return Ok(false);
        }
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
        self.stalled_until = None;
        Ok(true)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        match stream.write(data) {
            Ok(0) if !data.is_empty() => Err(TransportError::io(
                format!("write {}", self.addr),
                std::io::Error::from(ErrorKind::WriteZero),
            )),
            Ok(n) => {
                self.stalled_until = None;
                Ok(n)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                tracing::debug!(addr = %self.addr, "tcp write timed out, peer not reading");
                self.stalled_until = Some(Instant::now() + self.write_timeout);
                Ok(0)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(TransportError::io(format!("write {}", self.addr), e)),
        }
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        match self.stream {
            Some(ref mut stream) => stream
                .flush()
                .map_err(|e| TransportError::io(format!("flush {}", self.addr), e)),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.take() {
            tracing::debug!(addr = %self.addr, "tcp sink closed");
            // Peer may already be gone
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.stalled_until = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_tcp_sink_delivers_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            conn.read_to_end(&mut received).unwrap();
            received
        });

        let mut sink = TcpSink::new(addr.to_string());
        sink.open().unwrap();
        assert!(sink.can_write(Duration::ZERO).unwrap());
        assert_eq!(
            crate::sink::write_fully(&mut sink, b"hello", Duration::ZERO).unwrap(),
            5
        );
        sink.close().unwrap();

        assert_eq!(server.join().unwrap(), b"hello");
        assert!(!sink.is_open());
    }

    #[test]
    fn test_tcp_sink_handshake_accepted() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut login = [0u8; 6];
            conn.read_exact(&mut login).unwrap();
            conn.write_all(b"OK2\r\n").unwrap();
            let mut rest = Vec::new();
            conn.read_to_end(&mut rest).unwrap();
            (login, rest)
        });

        let mut sink =
            TcpSink::new(addr.to_string()).with_handshake(Handshake::new("LOGIN\n", "OK2"));
        sink.open().unwrap();
        sink.write(b"pcm").unwrap();
        sink.close().unwrap();

        let (login, rest) = server.join().unwrap();
        assert_eq!(&login, b"LOGIN\n");
        assert_eq!(rest, b"pcm");
    }

    #[test]
    fn test_tcp_sink_handshake_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut login = [0u8; 6];
            conn.read_exact(&mut login).unwrap();
            conn.write_all(b"Bad password\n").unwrap();
        });

        let mut sink =
            TcpSink::new(addr.to_string()).with_handshake(Handshake::new("LOGIN\n", "OK2"));
        let err = sink.open().unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, TransportError::Handshake { .. }));
        assert!(err.to_string().contains("Bad"));
        assert!(!sink.is_open());
    }

    #[test]
    fn test_tcp_sink_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut sink = TcpSink::new(format!("127.0.0.1:{port}"))
            .with_connect_timeout(Duration::from_millis(200));
        assert!(sink.open().is_err());
        assert!(!sink.is_open());
    }

    #[test]
    fn test_tcp_sink_stalled_peer_bounds_write_fully() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let server = thread::spawn(move || {
            // Accept and hold the connection without reading
            let (conn, _) = listener.accept().unwrap();
            let _ = done_rx.recv();
            drop(conn);
        });

        let write_timeout = Duration::from_millis(50);
        let mut sink = TcpSink::new(addr.to_string()).with_write_timeout(write_timeout);
        sink.open().unwrap();

        let block = vec![0u8; 64 * 1024];
        let started = Instant::now();
        let mut short_write = false;
        for _ in 0..256 {
            if !sink.can_write(Duration::ZERO).unwrap() {
                continue;
            }
            let n = crate::sink::write_fully(&mut sink, &block, Duration::ZERO).unwrap();
            if n < block.len() {
                short_write = true;
                break;
            }
        }
        let elapsed = started.elapsed();

        assert!(short_write, "socket buffers never filled");
        assert!(!sink.can_write(Duration::ZERO).unwrap());
        assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");

        // The backoff ends after one write timeout
        assert!(sink.can_write(write_timeout * 2).unwrap());

        sink.close().unwrap();
        done_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_sink_write_when_closed() {
        let mut sink = TcpSink::new("127.0.0.1:1");
        assert!(matches!(sink.write(b"x"), Err(TransportError::NotOpen)));
        assert!(!sink.can_write(Duration::ZERO).unwrap());
        assert!(sink.close().is_ok());
        assert_eq!(sink.name(), "tcp:127.0.0.1:1");
    }
}
