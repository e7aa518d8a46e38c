//! TCP surface of the daemon: the listener, per-peer connections, and the
//! optional upstream link.

pub mod connection;
pub mod listener;
pub mod upstream;

pub use connection::{Connection, ConnectionTuning};
pub use listener::MdServer;
pub use upstream::Upstream;
