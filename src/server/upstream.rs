//! The upstream link: this router's single optional parent.
//!
//! Outbound traffic (forwarded data, subscription replication, post-remove
//! bookkeeping) goes through the same send-queue machinery as peer
//! connections. Inbound datagrams are injected into the router with no
//! origin, which is what stops them from being reflected back up. Losing
//! the parent is fatal: a router cut off from its tree cannot do its job.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

use crate::error::{DisconnectReason, Result};
use crate::protocol::datagram::{Datagram, DatagramHandle};
use crate::protocol::framing::FrameBuffer;
use crate::routing::{DatagramSink, MessageDirector, UpstreamLink};
use crate::server::connection::{write_loop, ConnectionTuning, SendQueue};

/// Connected parent router.
pub struct Upstream {
    queue: SendQueue,
    peer: SocketAddr,
}

impl UpstreamLink for Upstream {
    fn forward(&self, dg: DatagramHandle) {
        if let Err(e) = self.queue.deliver(&dg) {
            tracing::error!(peer = %self.peer, error = %e, "Upstream send failed");
        }
    }
}

/// Connect to the parent and start pumping datagrams both ways.
pub async fn connect(
    addr: SocketAddr,
    director: MessageDirector,
    tuning: ConnectionTuning,
) -> Result<Arc<Upstream>> {
    let socket = TcpStream::connect(addr).await?;
    crate::server::listener::configure_socket(&socket)?;
    tracing::info!(peer = %addr, "Connected to upstream router");

    let (reader, writer) = socket.into_split();
    let (queue, rx) = SendQueue::new(tuning.write_buffer_max);
    tokio::spawn(write_loop(writer, rx, queue.clone(), tuning));
    tokio::spawn(read_loop(reader, director, queue.clone(), addr));

    Ok(Arc::new(Upstream { queue, peer: addr }))
}

/// Feed parent-sourced datagrams into the router. Any exit here takes the
/// process with it.
async fn read_loop(
    mut reader: OwnedReadHalf,
    director: MessageDirector,
    queue: SendQueue,
    peer: SocketAddr,
) {
    let mut frames = FrameBuffer::new();
    let mut closed = queue.closed();
    let mut chunk = BytesMut::with_capacity(64 * 1024);

    let reason = loop {
        chunk.clear();
        let n = tokio::select! {
            result = reader.read_buf(&mut chunk) => match result {
                Ok(0) => break DisconnectReason::RemoteClosed,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "Upstream read failed");
                    break DisconnectReason::IoError;
                }
            },
            _ = closed.changed() => {
                break closed.borrow().unwrap_or(DisconnectReason::LocalClose);
            }
        };

        match drain_frames(&director, &mut frames, &chunk[..n]) {
            Ok(()) => {}
            Err(reason) => break reason,
        }
    };

    tracing::error!(peer = %peer, reason = %reason, "Lost connection to upstream router");
    std::process::exit(1);
}

fn drain_frames(
    director: &MessageDirector,
    frames: &mut FrameBuffer,
    chunk: &[u8],
) -> std::result::Result<(), DisconnectReason> {
    match frames.take_exact(chunk) {
        Ok(Some(payload)) => {
            director.route(None, Datagram::from_bytes(&payload).into_handle());
            return Ok(());
        }
        Ok(None) => {}
        Err(_) => return Err(DisconnectReason::ProtocolError),
    }

    frames.extend(chunk);
    loop {
        match frames.next_frame() {
            Ok(Some(payload)) => {
                director.route(None, Datagram::from_bytes(&payload).into_handle());
            }
            Ok(None) => return Ok(()),
            Err(_) => return Err(DisconnectReason::ProtocolError),
        }
    }
}
