//! Length-prefixed datagram framing.
//!
//! Wire format: `u16_le length || length bytes payload`. No magic bytes, no
//! version tag. A declared length of zero is a protocol violation and costs
//! the peer its connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::constants::DgSize;
use super::datagram::Datagram;

/// Bytes of length prefix in front of every frame.
pub const LENGTH_PREFIX: usize = std::mem::size_of::<DgSize>();

/// Largest payload a frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = DgSize::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Peer declared a zero-length frame.
    #[error("zero-length frame")]
    ZeroLength,
    /// Datagram too large for the u16 length prefix.
    #[error("datagram of {0} bytes exceeds frame limit")]
    Oversize(usize),
}

/// Serialize one datagram as a wire frame.
pub fn encode_frame(dg: &Datagram) -> Result<Bytes, FramingError> {
    if dg.size() > MAX_FRAME_PAYLOAD {
        return Err(FramingError::Oversize(dg.size()));
    }
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX + dg.size());
    out.put_u16_le(dg.size() as DgSize);
    out.put_slice(dg.as_slice());
    Ok(out.freeze())
}

/// Accumulates raw reads from a connection and slices out complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Fast path: when nothing is buffered and a single recv produced
    /// exactly one complete frame, hand back its payload without going
    /// through the accumulation buffer.
    pub fn take_exact(&self, chunk: &[u8]) -> Result<Option<Bytes>, FramingError> {
        if !self.buf.is_empty() || chunk.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let declared = DgSize::from_le_bytes([chunk[0], chunk[1]]) as usize;
        if declared == 0 {
            return Err(FramingError::ZeroLength);
        }
        if declared == chunk.len() - LENGTH_PREFIX {
            return Ok(Some(Bytes::copy_from_slice(&chunk[LENGTH_PREFIX..])));
        }
        Ok(None)
    }

    /// Append raw bytes from the transport.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Slice off the next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let declared = DgSize::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if declared == 0 {
            return Err(FramingError::ZeroLength);
        }
        if self.buf.len() < LENGTH_PREFIX + declared {
            return Ok(None);
        }
        self.buf.advance(LENGTH_PREFIX);
        Ok(Some(self.buf.split_to(declared).freeze()))
    }
}
