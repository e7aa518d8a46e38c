//! Crate-level error and disconnect types.

use thiserror::Error;

use crate::protocol::datagram::DatagramEof;
use crate::protocol::framing::FramingError;
use crate::protocol::haproxy::PreambleError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Datagram(#[from] DatagramEof),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Preamble(#[from] PreambleError),

    #[error("unknown control message type {0}")]
    BadControlCode(u16),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("could not resolve address '{0}'")]
    AddressResolution(String),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Why a connection was torn down. Carried to `receive_disconnect`
/// handling and into the disconnect log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed or reset the transport.
    RemoteClosed,
    /// Peer violated the wire protocol (zero-length frame, bad preamble).
    ProtocolError,
    /// Send queue exceeded the configured byte limit.
    NoBufferSpace,
    /// A write did not complete within the configured deadline.
    TimedOut,
    /// Transport-level I/O failure.
    IoError,
    /// We closed the connection on purpose (shutdown).
    LocalClose,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::RemoteClosed => "remote closed",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::NoBufferSpace => "no buffer space",
            DisconnectReason::TimedOut => "timed out",
            DisconnectReason::IoError => "i/o error",
            DisconnectReason::LocalClose => "local close",
        };
        f.write_str(s)
    }
}
