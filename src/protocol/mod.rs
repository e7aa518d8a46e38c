//! Wire protocol: datagram layout, length-prefixed framing, and the
//! HAProxy preamble spoken in front of it.

pub mod constants;
pub mod datagram;
pub mod framing;
pub mod haproxy;

pub use constants::{Channel, CONTROL_CHANNEL, INVALID_CHANNEL};
pub use datagram::{Datagram, DatagramEof, DatagramHandle, DatagramIterator};
pub use framing::{encode_frame, FrameBuffer, FramingError};
pub use haproxy::{parse_preamble, PreambleError, PreambleStatus, ProxyPreamble};
