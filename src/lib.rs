#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod error;
pub mod machine;
pub mod mutex;
pub mod net;
pub mod node;
pub mod peer;
pub mod pool;
pub mod proto;
pub mod server;
pub mod telemetry;
pub mod tempstore;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers touch at the crate root.
pub use config::Config;
pub use mutex::{CriticalSection, DistributedMutex, MutexError};
pub use net::{Location, Socket};
pub use peer::{NetworkError, NetworkManager, PeerLink};
pub use pool::WorkerPool;
pub use proto::{Message, NodeId, Opcode};
