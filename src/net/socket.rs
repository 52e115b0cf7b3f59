//! Non-blocking TCP socket with cancellable polling.
//!
//! Readiness is discovered by attempting the operation and sleeping in short,
//! cancellable intervals on `WouldBlock`. Closing a socket is idempotent and
//! wakes every poll loop immediately, including a dialer waiting out its
//! retry delay.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::Location;

pub const DEFAULT_CONNECT_ATTEMPTS: usize = 10;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket closed")]
    Closed,
    #[error("{operation} timed out")]
    TimedOut { operation: &'static str },
    #[error("connection closed by peer")]
    Disconnected,
    #[error("failed to resolve {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("failed to connect to {target} after {attempts} attempts: {source}")]
    Connect {
        target: String,
        attempts: usize,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::TimedOut { .. })
    }
}

/// Close flag shared between a socket and the dialer that produced it. The
/// condvar lets `close` interrupt any poll or retry sleep.
struct CloseSignal {
    closed: Mutex<bool>,
    wake: Condvar,
}

impl CloseSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: Mutex::new(false),
            wake: Condvar::new(),
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().expect("close lock poisoned")
    }

    /// Returns true the first time; later calls are no-ops.
    fn close(&self) -> bool {
        let mut closed = self.closed.lock().expect("close lock poisoned");
        let first = !*closed;
        *closed = true;
        self.wake.notify_all();
        first
    }

    /// Sleeps up to `duration`; returns true if the signal closed before or
    /// during the wait.
    fn sleep(&self, duration: Duration) -> bool {
        let closed = self.closed.lock().expect("close lock poisoned");
        if *closed {
            return true;
        }
        let (closed, _timeout) = self
            .wake
            .wait_timeout(closed, duration)
            .expect("close lock poisoned");
        *closed
    }
}

/// An owned, connected, non-blocking TCP stream.
pub struct Socket {
    stream: TcpStream,
    signal: Arc<CloseSignal>,
    poll_timeout: Mutex<Option<Duration>>,
}

impl Socket {
    pub fn from_stream(
        stream: TcpStream,
        poll_timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        Self::with_signal(stream, CloseSignal::new(), poll_timeout)
    }

    fn with_signal(
        stream: TcpStream,
        signal: Arc<CloseSignal>,
        poll_timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            signal,
            poll_timeout: Mutex::new(poll_timeout),
        })
    }

    /// `None` disables the poll deadline (used while handshaking with slow
    /// peers).
    pub fn set_poll_timeout(&self, timeout: Option<Duration>) {
        *self.poll_timeout.lock().expect("socket lock poisoned") = timeout;
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        *self.poll_timeout.lock().expect("socket lock poisoned")
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.stream.local_addr()?)
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    /// Idempotent. Cancels every in-progress poll on this socket; their
    /// callers observe [`TransportError::Closed`].
    pub fn close(&self) {
        if self.signal.close() {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    /// Receives at least one byte, waiting up to the poll timeout for the
    /// socket to become readable. A timeout leaves the socket open.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let deadline = self.poll_timeout().map(|timeout| Instant::now() + timeout);
        loop {
            if self.signal.is_closed() {
                return Err(TransportError::Closed);
            }
            match (&self.stream).read(buf) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.wait_for_readiness(deadline, "receive")?;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }

    /// Sends the whole buffer. The poll deadline applies per quiet period: it
    /// resets whenever bytes leave the buffer.
    pub fn send_all(&self, buf: &[u8]) -> Result<(), TransportError> {
        let mut remaining = buf;
        let mut deadline = self.poll_timeout().map(|timeout| Instant::now() + timeout);
        while !remaining.is_empty() {
            if self.signal.is_closed() {
                return Err(TransportError::Closed);
            }
            match (&self.stream).write(remaining) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => {
                    remaining = &remaining[n..];
                    deadline = self.poll_timeout().map(|timeout| Instant::now() + timeout);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.wait_for_readiness(deadline, "send")?;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
        Ok(())
    }

    fn wait_for_readiness(
        &self,
        deadline: Option<Instant>,
        operation: &'static str,
    ) -> Result<(), TransportError> {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(TransportError::TimedOut { operation });
            }
        }
        if self.signal.sleep(POLL_INTERVAL) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("peer", &self.stream.peer_addr().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Dials one target with bounded retries. The dialer's close signal is
/// inherited by the socket it produces, so one `cancel` tears down the whole
/// attempt whether it is mid-retry or already connected.
pub struct Dialer {
    signal: Arc<CloseSignal>,
    connect_timeout: Duration,
    retry_timeout: Duration,
    attempts: usize,
    socket_poll_timeout: Option<Duration>,
}

impl Dialer {
    pub fn new(
        connect_timeout: Duration,
        retry_timeout: Duration,
        socket_poll_timeout: Option<Duration>,
    ) -> Self {
        Self {
            signal: CloseSignal::new(),
            connect_timeout,
            retry_timeout,
            attempts: DEFAULT_CONNECT_ATTEMPTS,
            socket_poll_timeout,
        }
    }

    pub fn cancel(&self) {
        self.signal.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_closed()
    }

    pub fn dial(&self, target: &Location) -> Result<Socket, TransportError> {
        let addr = target.resolve()?;
        let mut last_error = None;
        for attempt in 0..self.attempts {
            if attempt > 0 && self.signal.sleep(self.retry_timeout) {
                return Err(TransportError::Closed);
            }
            if self.signal.is_closed() {
                return Err(TransportError::Closed);
            }
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    return Socket::with_signal(
                        stream,
                        Arc::clone(&self.signal),
                        self.socket_poll_timeout,
                    );
                }
                Err(err) => {
                    tracing::debug!(peer = %target, attempt, "connect attempt failed: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(TransportError::Connect {
            target: target.to_string(),
            attempts: self.attempts,
            source: last_error
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no attempts")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn socket_pair() -> (Socket, Socket) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            Socket::from_stream(client, Some(Duration::from_secs(1))).unwrap(),
            Socket::from_stream(server, Some(Duration::from_secs(1))).unwrap(),
        )
    }

    #[test]
    fn round_trips_bytes() {
        let (a, b) = socket_pair();
        a.send_all(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn recv_times_out_without_closing() {
        let (a, _b) = socket_pair();
        a.set_poll_timeout(Some(Duration::from_millis(30)));
        let mut buf = [0u8; 4];
        let err = a.recv(&mut buf).unwrap_err();
        assert!(err.is_timeout());
        assert!(!a.is_closed());
    }

    #[test]
    fn close_cancels_a_blocked_recv() {
        let (a, _b) = socket_pair();
        a.set_poll_timeout(None);
        let a = Arc::new(a);
        let reader = Arc::clone(&a);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.recv(&mut buf)
        });
        thread::sleep(Duration::from_millis(20));
        a.close();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[test]
    fn close_is_idempotent() {
        let (a, _b) = socket_pair();
        a.close();
        a.close();
        assert!(a.is_closed());
    }

    #[test]
    fn peer_disconnect_surfaces() {
        let (a, b) = socket_pair();
        drop(b);
        let mut buf = [0u8; 4];
        // The peer vanished: either a clean EOF or a reset, depending on
        // timing, but never a hang.
        let err = a.recv(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Disconnected | TransportError::Io(_)
        ));
    }

    #[test]
    fn cancelled_dialer_stops_retrying() {
        // Dial a port nobody listens on with a long retry delay, then cancel.
        let dialer = Arc::new(Dialer::new(
            Duration::from_millis(100),
            Duration::from_secs(60),
            None,
        ));
        let target = Location::new("127.0.0.1", 1);
        let dialing = Arc::clone(&dialer);
        let handle = thread::spawn(move || dialing.dial(&target));
        thread::sleep(Duration::from_millis(50));
        dialer.cancel();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
