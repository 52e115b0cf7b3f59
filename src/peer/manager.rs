//! Peer network manager.
//!
//! Aggregates verified outbound (dialed) and inbound (accepted) connections
//! into one record per peer, keyed by node id. When every configured peer has
//! both directions, the manager emits a single connected snapshot to whoever
//! is waiting. The manager is the sole owner of every peer socket; snapshots
//! hand out shared references whose close authority stays here.
//!
//! The first hard error is terminal: `Recovering` is a declared state, but
//! this version transitions straight to `Broken` and fails every queued
//! callback exactly once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::config::PeerEntry;
use crate::net::{Location, Socket};
use crate::pool::WorkerPool;
use crate::proto::NodeId;
use crate::tempstore::TempStore;

use super::acceptor::Acceptor;
use super::connector::Connector;
use super::handshake::{DialOutcome, HandshakeError};
use super::PeerSettings;

#[derive(Debug, Error, Clone)]
pub enum NetworkError {
    #[error("failed to connect to peer server: {0}")]
    Dial(String),
    #[error("failed to get a connection from peer server: {0}")]
    Accept(String),
    #[error("cannot listen for peers: {0}")]
    Listen(String),
    #[error("peer link to node {peer} failed: {reason}")]
    Link { peer: NodeId, reason: String },
    #[error("peer network disconnected and cannot be recovered")]
    Broken,
    #[error("peer network stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Initializing,
    Connected,
    Recovering,
    Broken,
    Closed,
}

/// One entry of the connected snapshot: both directions of a peer link.
/// `incoming` carries the remote's messages to us; `outgoing` carries ours to
/// it.
#[derive(Clone)]
pub struct PeerLink {
    pub id: NodeId,
    pub location: Location,
    pub incoming: Arc<Socket>,
    pub outgoing: Arc<Socket>,
}

pub type ConnectedCallback = Box<dyn FnOnce(Result<Vec<PeerLink>, NetworkError>) + Send>;
pub type RecoveredCallback = Box<dyn FnOnce(Result<(), NetworkError>) + Send>;

#[derive(Default)]
struct PeerRecord {
    location: Option<Location>,
    incoming: Option<Arc<Socket>>,
    outgoing: Option<Arc<Socket>>,
}

#[derive(Default)]
struct CallbackQueues {
    connected: Vec<ConnectedCallback>,
    recovered: Vec<RecoveredCallback>,
}

struct MeshComponents {
    connector: Connector,
    acceptor: Acceptor,
}

pub struct NetworkManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    settings: PeerSettings,
    pool: WorkerPool,
    temp: TempStore,
    peer_locations: Vec<Location>,
    state: Mutex<NetworkState>,
    connections: Mutex<BTreeMap<NodeId, PeerRecord>>,
    callbacks: Mutex<CallbackQueues>,
    stop_error: Mutex<Option<NetworkError>>,
    components: Mutex<Option<MeshComponents>>,
}

impl NetworkManager {
    /// Plans the mesh from the configured peer list, skipping entries that
    /// name this node itself.
    pub fn new(
        settings: PeerSettings,
        peer_entries: &[PeerEntry],
        pool: WorkerPool,
        temp: TempStore,
    ) -> Self {
        let my_port = settings.port;
        let peer_locations = peer_entries
            .iter()
            .map(Location::from_peer)
            .filter(|location| {
                if location.is_self(my_port) {
                    tracing::debug!(%location, "skipping own entry in peer list");
                    false
                } else {
                    true
                }
            })
            .collect();
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                pool,
                temp,
                peer_locations,
                state: Mutex::new(NetworkState::Initializing),
                connections: Mutex::new(BTreeMap::new()),
                callbacks: Mutex::new(CallbackQueues::default()),
                stop_error: Mutex::new(None),
                components: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> NetworkState {
        *self.inner.state.lock().expect("manager lock poisoned")
    }

    pub fn is_connected(&self) -> bool {
        self.state() == NetworkState::Connected
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peer_locations.len()
    }

    /// Runs `callback` with the connected snapshot once the mesh is complete,
    /// or with an error if the mesh breaks or stops first. Fires exactly once.
    pub fn await_connected(
        &self,
        callback: impl FnOnce(Result<Vec<PeerLink>, NetworkError>) + Send + 'static,
    ) {
        if self.is_connected() {
            let snapshot = build_snapshot(&self.inner);
            self.inner.pool.schedule(move || callback(snapshot));
            return;
        }
        self.inner
            .callbacks
            .lock()
            .expect("manager lock poisoned")
            .connected
            .push(Box::new(callback));
    }

    /// Reports a broken peer link. Recovery is not implemented: the network
    /// transitions to `Broken` and the callback fires with an error.
    pub fn report_error(
        &self,
        error: NetworkError,
        callback: impl FnOnce(Result<(), NetworkError>) + Send + 'static,
    ) {
        self.inner
            .callbacks
            .lock()
            .expect("manager lock poisoned")
            .recovered
            .push(Box::new(callback));
        self.inner
            .stop_error
            .lock()
            .expect("manager lock poisoned")
            .get_or_insert(error);
        update_state(&self.inner, NetworkState::Broken);
    }

    /// Binds the listener and begins dialing every configured peer. Expected
    /// origins are registered with the acceptor before any dial goes out, so
    /// a fast remote cannot be rejected by its own victim.
    pub fn start(&self) -> Result<(), NetworkError> {
        tracing::info!(peers = self.inner.peer_locations.len(), "starting peer network");

        let weak = Arc::downgrade(&self.inner);
        let connector = Connector::new(
            self.inner.settings.clone(),
            self.inner.pool.clone(),
            self.inner.temp.clone(),
            Arc::new(move |result| {
                if let Some(inner) = weak.upgrade() {
                    on_client_connection(&inner, result);
                }
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        let acceptor = Acceptor::new(
            self.inner.settings.clone(),
            self.inner.pool.clone(),
            self.inner.temp.clone(),
            Arc::new(move |result| {
                if let Some(inner) = weak.upgrade() {
                    on_server_connection(&inner, result);
                }
            }),
        );

        acceptor
            .start()
            .map_err(|err| NetworkError::Listen(err.to_string()))?;

        for location in &self.inner.peer_locations {
            acceptor.await_connection_from(location);
        }
        for location in &self.inner.peer_locations {
            connector.connect(location.clone());
        }

        *self
            .inner
            .components
            .lock()
            .expect("manager lock poisoned") = Some(MeshComponents {
            connector,
            acceptor,
        });

        // A cluster of one has nothing to wait for.
        check_if_connected(&self.inner);
        Ok(())
    }

    pub fn stop(&self) {
        tracing::info!("stopping peer network");
        update_state(&self.inner, NetworkState::Closed);

        let components = self
            .inner
            .components
            .lock()
            .expect("manager lock poisoned")
            .take();
        if let Some(components) = components {
            components.connector.stop();
            components.acceptor.stop();
        }

        let connections = self.inner.connections.lock().expect("manager lock poisoned");
        for record in connections.values() {
            if let Some(socket) = &record.incoming {
                socket.close();
            }
            if let Some(socket) = &record.outgoing {
                socket.close();
            }
        }
    }
}

fn on_client_connection(inner: &Arc<ManagerInner>, result: Result<DialOutcome, HandshakeError>) {
    let out = match result {
        Ok(out) => out,
        Err(err) => {
            // A peer we cannot dial is down; the mesh cannot form.
            fail(inner, NetworkError::Dial(err.to_string()));
            return;
        }
    };

    tracing::debug!(peer = %out.peer_id, addr = %out.target, "verified client connection");
    {
        let mut connections = inner.connections.lock().expect("manager lock poisoned");
        let record = connections.entry(out.peer_id).or_default();
        record.location = Some(out.target);
        record.outgoing = Some(out.socket);
    }
    check_if_connected(inner);
}

fn on_server_connection(inner: &Arc<ManagerInner>, result: Result<DialOutcome, HandshakeError>) {
    let out = match result {
        Ok(out) => out,
        Err(err) => {
            // The remote failed our handshake; it is unlikely to get it right
            // by retrying.
            fail(inner, NetworkError::Accept(err.to_string()));
            return;
        }
    };

    tracing::debug!(peer = %out.peer_id, "verified server connection");
    {
        let mut connections = inner.connections.lock().expect("manager lock poisoned");
        let record = connections.entry(out.peer_id).or_default();
        record.incoming = Some(out.socket);
    }
    check_if_connected(inner);
}

fn fail(inner: &Arc<ManagerInner>, error: NetworkError) {
    tracing::error!("peer network failure: {error}");
    inner
        .stop_error
        .lock()
        .expect("manager lock poisoned")
        .get_or_insert(error);
    update_state(inner, NetworkState::Broken);
}

fn check_if_connected(inner: &Arc<ManagerInner>) {
    if fully_connected(inner) {
        update_state(inner, NetworkState::Connected);
    }
}

fn fully_connected(inner: &Arc<ManagerInner>) -> bool {
    let connections = inner.connections.lock().expect("manager lock poisoned");
    if connections.len() != inner.peer_locations.len() {
        return false;
    }
    let mut unmatched: Vec<&Location> = inner.peer_locations.iter().collect();
    for record in connections.values() {
        if record.incoming.is_none() || record.outgoing.is_none() {
            return false;
        }
        let Some(location) = &record.location else {
            return false;
        };
        match unmatched.iter().position(|candidate| *candidate == location) {
            Some(index) => {
                unmatched.swap_remove(index);
            }
            None => return false,
        }
    }
    unmatched.is_empty()
}

fn build_snapshot(inner: &Arc<ManagerInner>) -> Result<Vec<PeerLink>, NetworkError> {
    let connections = inner.connections.lock().expect("manager lock poisoned");
    let mut snapshot = Vec::with_capacity(connections.len());
    for (id, record) in connections.iter() {
        let (Some(location), Some(incoming), Some(outgoing)) =
            (&record.location, &record.incoming, &record.outgoing)
        else {
            return Err(NetworkError::Broken);
        };
        snapshot.push(PeerLink {
            id: *id,
            location: location.clone(),
            incoming: Arc::clone(incoming),
            outgoing: Arc::clone(outgoing),
        });
    }
    Ok(snapshot)
}

fn update_state(inner: &Arc<ManagerInner>, new_state: NetworkState) {
    let old_state = {
        let mut state = inner.state.lock().expect("manager lock poisoned");
        if *state == new_state || *state == NetworkState::Closed {
            return;
        }
        let old_state = *state;
        *state = new_state;
        old_state
    };

    match new_state {
        NetworkState::Connected => {
            if old_state == NetworkState::Recovering {
                deliver_recovered(inner, Ok(()));
            }
            deliver_connected(inner);
        }
        NetworkState::Broken | NetworkState::Closed => {
            let default = if new_state == NetworkState::Broken {
                NetworkError::Broken
            } else {
                NetworkError::Stopped
            };
            let error = inner
                .stop_error
                .lock()
                .expect("manager lock poisoned")
                .clone()
                .unwrap_or(default);
            deliver_error(inner, error);
        }
        NetworkState::Initializing | NetworkState::Recovering => {}
    }
}

fn deliver_connected(inner: &Arc<ManagerInner>) {
    let waiting = {
        let mut callbacks = inner.callbacks.lock().expect("manager lock poisoned");
        std::mem::take(&mut callbacks.connected)
    };
    for callback in waiting {
        let snapshot = build_snapshot(inner);
        inner.pool.schedule(move || callback(snapshot));
    }
}

fn deliver_recovered(inner: &Arc<ManagerInner>, result: Result<(), NetworkError>) {
    let waiting = {
        let mut callbacks = inner.callbacks.lock().expect("manager lock poisoned");
        std::mem::take(&mut callbacks.recovered)
    };
    for callback in waiting {
        let result = result.clone();
        inner.pool.schedule(move || callback(result));
    }
}

fn deliver_error(inner: &Arc<ManagerInner>, error: NetworkError) {
    let (connected, recovered) = {
        let mut callbacks = inner.callbacks.lock().expect("manager lock poisoned");
        (
            std::mem::take(&mut callbacks.connected),
            std::mem::take(&mut callbacks.recovered),
        )
    };
    for callback in connected {
        let error = error.clone();
        inner.pool.schedule(move || callback(Err(error)));
    }
    for callback in recovered {
        let error = error.clone();
        inner.pool.schedule(move || callback(Err(error)));
    }
}
