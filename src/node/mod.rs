//! Client node: wires the peer mesh, the mutex engine, and the file-server
//! sessions together, then hands control to the workload driver.

mod driver;

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;

use crate::config::Config;
use crate::mutex::DistributedMutex;
use crate::net::{Location, Socket, TransportError};
use crate::peer::{NetworkManager, PeerSettings};
use crate::pool::{WorkerPool, DEFAULT_WORKERS};
use crate::proto::{
    Message, MessageReader, MessageWriter, NodeId, Opcode, TextResponse, CLIENT_TRANSFER_CHUNK,
};
use crate::tempstore::TempStore;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no file servers configured")]
    NoServers,
    #[error("failed to connect to server {server}: {source}")]
    ServerConnect {
        server: Location,
        source: TransportError,
    },
    #[error("server {server} returned an error: {message}")]
    ServerFault { server: Location, message: String },
    #[error("server {server} sent an unexpected {got:?}")]
    UnexpectedResponse { server: Location, got: Opcode },
    #[error("server responded to enquiry with no file names")]
    NoFiles,
}

/// Runtime options for a client node, distilled from the command line.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub node_id: NodeId,
    pub port: u16,
    pub temp_dir: PathBuf,
    pub poll_timeout: Duration,
    pub retry_timeout: Duration,
    /// Stop cleanly after this many driver operations; `None` runs until a
    /// fault or the process is killed.
    pub operations: Option<u64>,
}

/// One connected file server.
#[derive(Clone)]
pub struct ServerSession {
    pub location: Location,
    pub socket: Arc<Socket>,
    pub reader: MessageReader,
    pub writer: MessageWriter,
}

/// First fault wins; `wait` blocks until something trips it. A clean driver
/// finish trips it with no error.
#[derive(Clone)]
pub struct FaultCell {
    inner: Arc<(Mutex<FaultState>, Condvar)>,
}

struct FaultState {
    tripped: bool,
    fault: Option<crate::Error>,
}

impl FaultCell {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(FaultState {
                    tripped: false,
                    fault: None,
                }),
                Condvar::new(),
            )),
        }
    }

    pub fn trip(&self, fault: Option<crate::Error>) {
        let (state, signal) = &*self.inner;
        let mut state = state.lock().expect("fault lock poisoned");
        if !state.tripped {
            state.tripped = true;
            state.fault = fault;
            signal.notify_all();
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.0.lock().expect("fault lock poisoned").tripped
    }

    pub fn wait(&self) -> Option<crate::Error> {
        let (state, signal) = &*self.inner;
        let mut state = state.lock().expect("fault lock poisoned");
        while !state.tripped {
            state = signal.wait(state).expect("fault lock poisoned");
        }
        state.fault.take()
    }
}

impl Default for FaultCell {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ClientNode;

impl ClientNode {
    /// Runs the node to completion: connect to every file server, form the
    /// peer mesh, then drive random reads and writes under the distributed
    /// lock. Returns when the workload finishes or anything faults.
    pub fn run(options: NodeOptions, config: Config) -> crate::Result<()> {
        let pool = WorkerPool::start(DEFAULT_WORKERS);
        let temp = TempStore::new(&options.temp_dir);

        let sessions = connect_servers(&config, &options, &pool, &temp)?;
        let files = fetch_file_names(&sessions)?;
        tracing::info!(servers = sessions.len(), files = files.len(), "connected to file servers");

        let settings = PeerSettings {
            node_id: options.node_id,
            port: options.port,
            password: config.password.clone(),
            poll_timeout: options.poll_timeout,
            retry_timeout: options.retry_timeout,
        };
        let manager = NetworkManager::new(settings, &config.peers, pool.clone(), temp.clone());

        let faults = FaultCell::new();
        let engine_faults = faults.clone();
        let engine = Arc::new(DistributedMutex::new(
            options.node_id,
            manager,
            pool.clone(),
            temp.clone(),
            Arc::new(move |err| engine_faults.trip(Some(err.into()))),
        ));

        let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);
        engine.start(move |result| {
            let _ = ready_tx.send(result);
        })?;
        ready_rx
            .recv()
            .map_err(|_| crate::Error::Mutex(crate::mutex::MutexError::Network(
                crate::peer::NetworkError::Stopped,
            )))??;
        tracing::info!("peer network connected");

        let driver_handle = driver::spawn(
            Arc::clone(&engine),
            sessions.clone(),
            files,
            options.node_id,
            options.operations,
            faults.clone(),
        );

        let fault = faults.wait();
        tracing::info!("shutting down");
        engine.stop();
        for session in &sessions {
            session.socket.close();
        }
        let _ = driver_handle.join();
        pool.shutdown();
        if let Err(err) = temp.sweep() {
            tracing::warn!("failed to sweep temp directory: {err}");
        }

        match fault {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn connect_servers(
    config: &Config,
    options: &NodeOptions,
    pool: &WorkerPool,
    temp: &TempStore,
) -> crate::Result<Vec<ServerSession>> {
    if config.servers.is_empty() {
        return Err(NodeError::NoServers.into());
    }

    let mut sessions = Vec::with_capacity(config.servers.len());
    for entry in &config.servers {
        let location = Location::from_server(entry);
        tracing::info!(server = %location, "connecting to file server");
        let addr = location.resolve().map_err(|source| NodeError::ServerConnect {
            server: location.clone(),
            source,
        })?;
        let stream = std::net::TcpStream::connect_timeout(&addr, options.poll_timeout)
            .map_err(|err| NodeError::ServerConnect {
                server: location.clone(),
                source: TransportError::Io(err),
            })?;
        let socket = Arc::new(
            Socket::from_stream(stream, Some(options.poll_timeout)).map_err(|source| {
                NodeError::ServerConnect {
                    server: location.clone(),
                    source,
                }
            })?,
        );
        sessions.push(ServerSession {
            location,
            reader: MessageReader::new(Arc::clone(&socket), pool.clone(), temp.clone()),
            writer: MessageWriter::new(Arc::clone(&socket), pool.clone(), CLIENT_TRANSFER_CHUNK),
            socket,
        });
    }
    Ok(sessions)
}

/// Asks one server (any of them; their directories mirror each other) for the
/// list of files available to work on.
fn fetch_file_names(sessions: &[ServerSession]) -> crate::Result<Vec<String>> {
    let session = sessions
        .choose(&mut rand::thread_rng())
        .expect("sessions checked non-empty");
    tracing::info!(server = %session.location, "fetching file names");

    session.writer.write_blocking(Message::enquiry())?;
    let msg = session.reader.read_blocking()?;
    match msg.opcode {
        Opcode::Response => {
            let response = TextResponse::from_message(msg).map_err(crate::Error::Proto)?;
            let files: Vec<String> = response
                .text
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            if files.is_empty() {
                return Err(NodeError::NoFiles.into());
            }
            tracing::debug!(count = files.len(), "received file names");
            Ok(files)
        }
        Opcode::Error => {
            let message = crate::proto::ErrorText::from_message(msg)
                .map(|e| e.message)
                .unwrap_or_else(|_| "unreadable error body".to_string());
            Err(NodeError::ServerFault {
                server: session.location.clone(),
                message,
            }
            .into())
        }
        got => Err(NodeError::UnexpectedResponse {
            server: session.location.clone(),
            got,
        }
        .into()),
    }
}
