//! Inbound listener for the peer mesh.
//!
//! Accepts TCP connections on the configured port, but only from addresses
//! the manager told it to expect. An allowed connection gets an accept-side
//! handshake; anything else is dropped on the floor. Poll deadlines are
//! disabled on accepted sockets: slow peers may take their time during the
//! handshake, and the receive half of a peer link legitimately idles forever.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::net::{Location, Socket, TransportError};
use crate::pool::WorkerPool;
use crate::tempstore::TempStore;

use super::handshake::{AcceptTask, DialOutcome, HandshakeError};
use super::PeerSettings;

/// Verified inbound link: same shape as the dial side's export.
pub type AcceptOutcome = DialOutcome;

pub type AcceptCallback = Arc<dyn Fn(Result<AcceptOutcome, HandshakeError>) + Send + Sync>;

const ACCEPT_POLL: Duration = Duration::from_millis(25);

pub struct Acceptor {
    inner: Arc<AcceptorInner>,
}

struct AcceptorInner {
    settings: PeerSettings,
    pool: WorkerPool,
    temp: TempStore,
    on_connection: AcceptCallback,
    /// Multiset of expected remote addresses; several peers may sit behind
    /// one host.
    allowed: Mutex<HashMap<IpAddr, usize>>,
    pending: Mutex<HashMap<SocketAddr, AcceptTask>>,
    shutdown: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Acceptor {
    pub fn new(
        settings: PeerSettings,
        pool: WorkerPool,
        temp: TempStore,
        on_connection: AcceptCallback,
    ) -> Self {
        Self {
            inner: Arc::new(AcceptorInner {
                settings,
                pool,
                temp,
                on_connection,
                allowed: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
                accept_thread: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", self.inner.settings.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(port = local_addr.port(), "peer acceptor listening");
        *self.inner.local_addr.lock().expect("acceptor lock poisoned") = Some(local_addr);

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("peer-acceptor".to_string())
            .spawn(move || run_accept_loop(listener, inner))
            .map_err(TransportError::Io)?;
        *self
            .inner
            .accept_thread
            .lock()
            .expect("acceptor lock poisoned") = Some(handle);
        Ok(())
    }

    /// Adds `location` to the allowed set. Called as the connector begins
    /// dialing that peer; the remote may connect back whenever it likes.
    pub fn await_connection_from(&self, location: &Location) {
        tracing::info!(%location, "awaiting connection from peer");
        match location.resolve_ip() {
            Ok(ip) => {
                *self
                    .inner
                    .allowed
                    .lock()
                    .expect("acceptor lock poisoned")
                    .entry(ip)
                    .or_insert(0) += 1;
            }
            Err(err) => {
                tracing::warn!(%location, "cannot resolve awaited peer: {err}");
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("acceptor lock poisoned")
    }

    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        let handle = self
            .inner
            .accept_thread
            .lock()
            .expect("acceptor lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let pending: Vec<AcceptTask> = {
            let mut map = self.inner.pending.lock().expect("acceptor lock poisoned");
            map.drain().map(|(_, task)| task).collect()
        };
        for task in &pending {
            task.cancel();
        }
    }
}

fn run_accept_loop(listener: TcpListener, inner: Arc<AcceptorInner>) {
    loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, remote)) => handle_accepted(&inner, stream, remote),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!("accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_accepted(inner: &Arc<AcceptorInner>, stream: std::net::TcpStream, remote: SocketAddr) {
    tracing::debug!(%remote, "received connection");
    {
        let allowed = inner.allowed.lock().expect("acceptor lock poisoned");
        if !allowed.get(&remote.ip()).is_some_and(|count| *count > 0) {
            tracing::debug!(%remote, "rejecting connection from unexpected address");
            return;
        }
    }

    // No poll deadline while the peer handshakes; see the module docs.
    let socket = match Socket::from_stream(stream, None) {
        Ok(socket) => Arc::new(socket),
        Err(err) => {
            tracing::warn!(%remote, "failed to adopt accepted socket: {err}");
            return;
        }
    };

    let origin = Location::new(remote.ip().to_string(), remote.port());
    let mut pending = inner.pending.lock().expect("acceptor lock poisoned");
    if pending.contains_key(&remote) {
        tracing::warn!(%remote, "duplicate in-flight handshake, dropping connection");
        return;
    }

    tracing::debug!(%remote, "starting handshake");
    let completion_inner = Arc::clone(inner);
    let task = AcceptTask::spawn(
        inner.settings.clone(),
        origin,
        socket,
        inner.pool.clone(),
        inner.temp.clone(),
        move |result| {
            completion_inner
                .pending
                .lock()
                .expect("acceptor lock poisoned")
                .remove(&remote);
            (completion_inner.on_connection)(result);
        },
    );
    pending.insert(remote, task);
}
