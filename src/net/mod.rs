//! Transport layer: locations and non-blocking sockets.

mod location;
mod socket;

pub use location::{local_ip, Location};
pub use socket::{Dialer, Socket, TransportError, DEFAULT_CONNECT_ATTEMPTS};
