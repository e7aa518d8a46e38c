//! Datagram construction and traversal.
//!
//! A datagram is an append-write byte buffer: `u8 receiver_count`, then
//! `receiver_count` little-endian channels, then the message body. Reads go
//! through [`DatagramIterator`], a cursor that fails with [`DatagramEof`]
//! instead of panicking when the buffer runs short.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use super::constants::{Channel, CONTROL_CHANNEL};

/// Reference-counted handle shared across the fan-out path.
pub type DatagramHandle = Arc<Datagram>;

/// Raised when a read runs past the end of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("datagram too short: wanted {wanted} bytes at offset {offset}, size is {size}")]
pub struct DatagramEof {
    pub wanted: usize,
    pub offset: usize,
    pub size: usize,
}

/// An append-write message buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datagram {
    buf: BytesMut,
}

impl Datagram {
    /// Create an empty datagram with no receiver header.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    /// Create a datagram addressed to a single channel.
    pub fn to_channel(receiver: Channel) -> Self {
        let mut dg = Self::new();
        dg.add_u8(1);
        dg.add_channel(receiver);
        dg
    }

    /// Create a datagram addressed to several channels.
    pub fn to_channels(receivers: &[Channel]) -> Self {
        debug_assert!(receivers.len() <= u8::MAX as usize);
        let mut dg = Self::new();
        dg.add_u8(receivers.len() as u8);
        for &ch in receivers {
            dg.add_channel(ch);
        }
        dg
    }

    /// Create a control message: addressed to the control channel with the
    /// given 16-bit type code already appended.
    pub fn control(msg_type: u16) -> Self {
        let mut dg = Self::to_channel(CONTROL_CHANNEL);
        dg.add_u16(msg_type);
        dg
    }

    /// Wrap received bytes as a datagram.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
        }
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn add_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn add_channel(&mut self, ch: Channel) {
        self.add_u64(ch);
    }

    /// Append raw bytes with no length prefix.
    pub fn add_data(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Append a u16-length-prefixed blob.
    pub fn add_blob(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= u16::MAX as usize);
        self.add_u16(data.len() as u16);
        self.buf.put_slice(data);
    }

    /// Append a u16-length-prefixed UTF-8 string.
    pub fn add_string(&mut self, s: &str) {
        self.add_blob(s.as_bytes());
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Freeze into a handle for routing.
    pub fn into_handle(self) -> DatagramHandle {
        Arc::new(self)
    }
}

/// Read cursor over a datagram.
#[derive(Debug, Clone)]
pub struct DatagramIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DatagramIterator<'a> {
    pub fn new(dg: &'a Datagram) -> Self {
        Self {
            data: dg.as_slice(),
            offset: 0,
        }
    }

    /// Start reading at a given offset (e.g. just past the receiver header).
    pub fn with_offset(dg: &'a Datagram, offset: usize) -> Self {
        Self {
            data: dg.as_slice(),
            offset,
        }
    }

    pub fn tell(&self) -> usize {
        self.offset
    }

    pub fn seek(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DatagramEof> {
        if self.remaining() < n {
            return Err(DatagramEof {
                wanted: n,
                offset: self.offset,
                size: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DatagramEof> {
        self.take(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8, DatagramEof> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DatagramEof> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, DatagramEof> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, DatagramEof> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_channel(&mut self) -> Result<Channel, DatagramEof> {
        self.read_u64()
    }

    /// Read a u16-length-prefixed blob.
    pub fn read_blob(&mut self) -> Result<&'a [u8], DatagramEof> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    /// Read a u16-length-prefixed UTF-8 string. Invalid UTF-8 is replaced
    /// rather than rejected; the field is display-only.
    pub fn read_string(&mut self) -> Result<String, DatagramEof> {
        let bytes = self.read_blob()?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Everything from the cursor to the end of the datagram.
    pub fn read_remainder(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }
}

/// Decode the receiver header, returning the channel list.
pub fn read_receivers(dgi: &mut DatagramIterator<'_>) -> Result<Vec<Channel>, DatagramEof> {
    let count = dgi.read_u8()?;
    let mut channels = Vec::with_capacity(count as usize);
    for _ in 0..count {
        channels.push(dgi.read_channel()?);
    }
    Ok(channels)
}

/// True if the datagram is addressed to the control channel alone.
///
/// A datagram whose first receiver is not the control channel is never
/// interpreted as control, no matter what its body contains.
pub fn is_control(dg: &Datagram) -> bool {
    let mut dgi = DatagramIterator::new(dg);
    matches!(
        (dgi.read_u8(), dgi.read_channel()),
        (Ok(1), Ok(CONTROL_CHANNEL))
    )
}
