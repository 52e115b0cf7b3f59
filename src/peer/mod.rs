//! Peer mesh: handshakes, dialing, accepting, and the network manager that
//! assembles both directions into a usable topology.

mod acceptor;
mod connector;
mod handshake;
mod manager;

pub use acceptor::{AcceptOutcome, Acceptor};
pub use connector::Connector;
pub use handshake::{AcceptTask, DialOutcome, DialTask, HandshakeError};
pub use manager::{NetworkError, NetworkManager, NetworkState, PeerLink};

use std::time::Duration;

use crate::proto::NodeId;

/// Settings shared by every component of the peer mesh.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub node_id: NodeId,
    pub port: u16,
    pub password: String,
    /// Poll deadline on dialed sockets. Accepted sockets run without one: the
    /// receive side of a peer link must be allowed to sit idle indefinitely.
    pub poll_timeout: Duration,
    /// Delay between connect attempts while the mesh forms.
    pub retry_timeout: Duration,
}
