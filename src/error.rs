use thiserror::Error;

use crate::config::ConfigError;
use crate::mutex::MutexError;
use crate::net::TransportError;
use crate::node::NodeError;
use crate::peer::NetworkError;
use crate::proto::{ProtoError, ServiceError};
use crate::server::ServerError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-subsystem errors; each layer converts at its
/// own boundary and nothing is swallowed on the way up.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Mutex(#[from] MutexError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
