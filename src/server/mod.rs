//! File server: serves last-line reads, appends, and file listings to client
//! nodes over the shared wire protocol. The clients coordinate write access
//! among themselves; the server applies whatever arrives, in order, one
//! connection per client.

mod files;

pub use files::FileService;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::net::Socket;
use crate::pool::WorkerPool;
use crate::proto::{
    AppendLine, ErrorText, Message, MessageReader, MessageWriter, Opcode, ReadFile, ServiceError,
    TextResponse, SERVER_TRANSFER_CHUNK,
};
use crate::tempstore::TempStore;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("managed directory {path} does not exist")]
    MissingRoot { path: PathBuf },
    #[error("managed directory {path} contains no files")]
    EmptyRoot { path: PathBuf },
    #[error("invalid file access: {name:?}")]
    InvalidFileAccess { name: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot listen for clients: {0}")]
    Listen(std::io::Error),
}

const ACCEPT_POLL: Duration = Duration::from_millis(25);

pub struct FileServer {
    files: Arc<FileService>,
    pool: WorkerPool,
    temp: TempStore,
    port: u16,
}

pub struct FileServerHandle {
    shutdown: Arc<AtomicBool>,
    sessions: Arc<Mutex<Vec<Arc<Socket>>>>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl FileServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes every client session, and joins the accept
    /// loop. Session threads wind down as their sockets error out.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for socket in self.sessions.lock().expect("server lock poisoned").iter() {
            socket.close();
        }
        let _ = self.join.join();
    }

    /// Blocks until the accept loop exits (it runs until the process dies or
    /// `shutdown` is flipped by another handle-holder).
    pub fn join(self) {
        let _ = self.join.join();
    }
}

impl FileServer {
    pub fn new(root: impl Into<PathBuf>, port: u16, pool: WorkerPool, temp: TempStore) -> Result<Self, ServerError> {
        Ok(Self {
            files: Arc::new(FileService::new(root)?),
            pool,
            temp,
            port,
        })
    }

    pub fn start(self) -> Result<FileServerHandle, ServerError> {
        let listener =
            TcpListener::bind(("0.0.0.0", self.port)).map_err(ServerError::Listen)?;
        listener.set_nonblocking(true).map_err(ServerError::Listen)?;
        let local_addr = listener.local_addr().map_err(ServerError::Listen)?;
        tracing::info!(port = local_addr.port(), root = %self.files.root().display(), "file server listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let sessions: Arc<Mutex<Vec<Arc<Socket>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_sessions = Arc::clone(&sessions);
        let files = Arc::clone(&self.files);
        let pool = self.pool.clone();
        let temp = self.temp.clone();
        let join = thread::Builder::new()
            .name("file-server".to_string())
            .spawn(move || {
                run_accept_loop(listener, files, pool, temp, accept_shutdown, accept_sessions)
            })
            .map_err(ServerError::Listen)?;

        Ok(FileServerHandle {
            shutdown,
            sessions,
            join,
            local_addr,
        })
    }
}

fn run_accept_loop(
    listener: TcpListener,
    files: Arc<FileService>,
    pool: WorkerPool,
    temp: TempStore,
    shutdown: Arc<AtomicBool>,
    sessions: Arc<Mutex<Vec<Arc<Socket>>>>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, remote)) => {
                tracing::info!(%remote, "client connected");
                match adopt_session(stream) {
                    Ok(socket) => {
                        sessions
                            .lock()
                            .expect("server lock poisoned")
                            .push(Arc::clone(&socket));
                        let files = Arc::clone(&files);
                        let pool = pool.clone();
                        let temp = temp.clone();
                        thread::spawn(move || run_client_session(socket, files, pool, temp));
                    }
                    Err(err) => tracing::warn!(%remote, "failed to adopt client socket: {err}"),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!("client accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn adopt_session(stream: TcpStream) -> Result<Arc<Socket>, crate::net::TransportError> {
    // Client sessions legitimately idle between operations; no poll deadline.
    Ok(Arc::new(Socket::from_stream(stream, None)?))
}

fn run_client_session(
    socket: Arc<Socket>,
    files: Arc<FileService>,
    pool: WorkerPool,
    temp: TempStore,
) {
    let reader = MessageReader::new(Arc::clone(&socket), pool.clone(), temp);
    let writer = MessageWriter::new(Arc::clone(&socket), pool, SERVER_TRANSFER_CHUNK);

    loop {
        let msg = match reader.read_blocking() {
            Ok(msg) => msg,
            Err(err) => {
                session_ended(&err);
                break;
            }
        };

        let keep_going = match msg.opcode {
            Opcode::Enquiry => handle_enquiry(&files, &writer),
            Opcode::Read => handle_read(&files, &writer, msg),
            Opcode::Write => handle_write(&files, &writer, msg),
            Opcode::Shutdown => {
                let _ = writer.write_blocking(Message::ok());
                false
            }
            other => {
                tracing::warn!(?other, "unsupported request from client");
                let _ = writer
                    .write_blocking(ErrorText::new("unsupported request").into_message());
                false
            }
        };
        if !keep_going {
            break;
        }
    }
    socket.close();
}

fn session_ended(err: &ServiceError) {
    match err {
        ServiceError::Transport(transport) if !transport.is_timeout() => {
            tracing::info!("client session ended: {transport}");
        }
        other => tracing::warn!("client session failed: {other}"),
    }
}

fn handle_enquiry(files: &FileService, writer: &MessageWriter) -> bool {
    tracing::info!("received enquiry");
    match files.list_files() {
        Ok(names) => writer
            .write_blocking(TextResponse::new(names.join(", ")).into_message())
            .is_ok(),
        Err(err) => {
            let _ = writer.write_blocking(ErrorText::new(err.to_string()).into_message());
            false
        }
    }
}

fn handle_read(files: &FileService, writer: &MessageWriter, msg: Message) -> bool {
    let read = match ReadFile::from_message(msg) {
        Ok(read) => read,
        Err(err) => {
            let _ = writer.write_blocking(ErrorText::new(err.to_string()).into_message());
            return false;
        }
    };
    tracing::info!(file = %read.file_name, "received read");
    match files.read_last_line(&read.file_name) {
        Ok(line) => writer
            .write_blocking(TextResponse::new(line).into_message())
            .is_ok(),
        Err(err) => {
            let _ = writer.write_blocking(ErrorText::new(err.to_string()).into_message());
            false
        }
    }
}

fn handle_write(files: &FileService, writer: &MessageWriter, msg: Message) -> bool {
    let write = match AppendLine::from_message(msg) {
        Ok(write) => write,
        Err(err) => {
            let _ = writer.write_blocking(ErrorText::new(err.to_string()).into_message());
            return false;
        }
    };
    tracing::info!(file = %write.file_name, "received write");
    match files.append_line(&write.file_name, &write.line) {
        Ok(()) => writer.write_blocking(Message::ok()).is_ok(),
        Err(err) => {
            let _ = writer.write_blocking(ErrorText::new(err.to_string()).into_message());
            false
        }
    }
}
