//! Per-peer connection handling.
//!
//! Each accepted socket gets a `Connection`: an optional HAProxy preamble
//! phase, then a read loop slicing frames out of the byte stream, and a
//! writer task draining the send queue. The send queue is the participant's
//! delivery sink; routing workers push encoded frames into it from any
//! thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::config::MdConfig;
use crate::error::{DisconnectReason, Error, Result};
use crate::protocol::datagram::{Datagram, DatagramHandle};
use crate::protocol::framing::{encode_frame, FrameBuffer};
use crate::protocol::haproxy::{parse_preamble, PreambleStatus, ProxyPreamble};
use crate::routing::{DatagramSink, MessageDirector, Participant};

/// Read buffer growth step.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Write-side limits shared by inbound peers and the upstream link.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionTuning {
    /// Deadline for a single write; zero disables the timer.
    pub write_timeout: Duration,
    /// Send queue cap in bytes; zero means unlimited.
    pub write_buffer_max: u64,
}

impl ConnectionTuning {
    pub fn from_config(config: &MdConfig) -> Self {
        Self {
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            write_buffer_max: config.write_buffer_max,
        }
    }
}

/// Handle onto a connection's outbound path. Cloneable; all clones feed
/// the same writer task.
#[derive(Clone)]
pub(crate) struct SendQueue {
    tx: mpsc::UnboundedSender<Bytes>,
    queued_bytes: Arc<AtomicU64>,
    max_bytes: u64,
    close_tx: Arc<watch::Sender<Option<DisconnectReason>>>,
}

impl SendQueue {
    pub(crate) fn new(max_bytes: u64) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, _) = watch::channel(None);
        (
            Self {
                tx,
                queued_bytes: Arc::new(AtomicU64::new(0)),
                max_bytes,
                close_tx: Arc::new(close_tx),
            },
            rx,
        )
    }

    /// Enqueue one encoded frame. Blowing the byte cap tears the whole
    /// connection down rather than stalling the router.
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        let len = frame.len() as u64;
        let total = self.queued_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if self.max_bytes != 0 && total > self.max_bytes {
            self.close(DisconnectReason::NoBufferSpace);
            return Err(Error::ConnectionClosed);
        }
        self.tx.send(frame).map_err(|_| Error::ConnectionClosed)
    }

    /// Request teardown. The first reason wins; later calls are no-ops.
    pub fn close(&self, reason: DisconnectReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn closed(&self) -> watch::Receiver<Option<DisconnectReason>> {
        self.close_tx.subscribe()
    }
}

impl DatagramSink for SendQueue {
    fn deliver(&self, dg: &DatagramHandle) -> Result<()> {
        let frame = encode_frame(dg)?;
        self.send_frame(frame)
    }
}

/// Drain the send queue onto the socket, enforcing the write deadline.
pub(crate) async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    queue: SendQueue,
    tuning: ConnectionTuning,
) {
    let mut closed = queue.closed();
    loop {
        let frame = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.changed() => break,
        };

        let write = writer.write_all(&frame);
        let result = if tuning.write_timeout.is_zero() {
            write.await
        } else {
            match tokio::time::timeout(tuning.write_timeout, write).await {
                Ok(result) => result,
                Err(_) => {
                    queue.close(DisconnectReason::TimedOut);
                    break;
                }
            }
        };

        if result.is_err() {
            queue.close(DisconnectReason::IoError);
            break;
        }
        queue.queued_bytes.fetch_sub(frame.len() as u64, Ordering::AcqRel);
    }
    let _ = writer.shutdown().await;
}

/// One accepted downstream peer.
pub struct Connection {
    session_id: u64,
    socket: TcpStream,
    peer_addr: SocketAddr,
    director: MessageDirector,
    tuning: ConnectionTuning,
    haproxy: bool,
}

impl Connection {
    pub fn new(
        session_id: u64,
        socket: TcpStream,
        peer_addr: SocketAddr,
        director: MessageDirector,
        tuning: ConnectionTuning,
        haproxy: bool,
    ) -> Self {
        Self {
            session_id,
            socket,
            peer_addr,
            director,
            tuning,
            haproxy,
        }
    }

    /// Drive the connection to completion. Returns once the peer is gone
    /// and its participant has been removed from the router.
    pub async fn run(mut self) -> Result<()> {
        let mut remote = self.peer_addr;
        let mut leftover = Vec::new();

        if self.haproxy {
            let preamble = match self.read_preamble().await {
                Ok(Some((preamble, rest))) => {
                    leftover = rest;
                    preamble
                }
                Ok(None) => {
                    tracing::debug!(
                        session_id = self.session_id,
                        peer = %self.peer_addr,
                        "Peer closed during PROXY preamble"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = self.session_id,
                        peer = %self.peer_addr,
                        error = %e,
                        reason = %DisconnectReason::ProtocolError,
                        "Rejecting connection with bad PROXY preamble"
                    );
                    return Ok(());
                }
            };

            if let Some(addr) = preamble.remote {
                remote = addr;
            }
            if preamble.is_local {
                tracing::debug!(
                    session_id = self.session_id,
                    "PROXY health probe connection"
                );
            }
            if !preamble.tlvs.is_empty() {
                tracing::trace!(
                    session_id = self.session_id,
                    tlv_bytes = preamble.tlvs.len(),
                    "PROXY preamble carried TLVs"
                );
            }
        }

        let (reader, writer) = self.socket.into_split();
        let (queue, rx) = SendQueue::new(self.tuning.write_buffer_max);
        tokio::spawn(write_loop(writer, rx, queue.clone(), self.tuning));

        let participant = self
            .director
            .add_participant(remote.to_string(), Box::new(queue.clone()));

        tracing::info!(
            session_id = self.session_id,
            peer = %remote,
            "Routing peer connected"
        );

        let reason = read_loop(&self.director, &participant, reader, &queue, &leftover).await;

        queue.close(reason);
        self.director.remove_participant(participant.id());

        tracing::info!(
            session_id = self.session_id,
            peer = %remote,
            name = %participant.name(),
            reason = %reason,
            "Routing peer disconnected"
        );
        Ok(())
    }

    /// Accumulate and parse the PROXY preamble. `Ok(None)` means the peer
    /// closed before completing it.
    async fn read_preamble(&mut self) -> Result<Option<(ProxyPreamble, Vec<u8>)>> {
        let mut buf = Vec::with_capacity(256);
        let mut chunk = [0u8; 512];
        loop {
            match parse_preamble(&buf)? {
                PreambleStatus::Done { preamble, consumed } => {
                    return Ok(Some((preamble, buf.split_off(consumed))));
                }
                PreambleStatus::NeedMore => {}
            }
            let n = self.socket.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Pull bytes off the socket and feed complete frames into the router
/// until something ends the connection.
async fn read_loop(
    director: &MessageDirector,
    participant: &Arc<Participant>,
    mut reader: OwnedReadHalf,
    queue: &SendQueue,
    leftover: &[u8],
) -> DisconnectReason {
    let mut frames = FrameBuffer::new();
    let mut closed = queue.closed();
    let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);

    // Bytes that shared a recv with the preamble enter the codec first.
    if !leftover.is_empty() {
        if let Err(reason) = feed(director, participant, &mut frames, leftover) {
            return reason;
        }
    }

    loop {
        chunk.clear();
        let n = tokio::select! {
            result = reader.read_buf(&mut chunk) => match result {
                Ok(0) => return DisconnectReason::RemoteClosed,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "Read failed");
                    return DisconnectReason::IoError;
                }
            },
            _ = closed.changed() => {
                return closed.borrow().unwrap_or(DisconnectReason::LocalClose);
            }
        };

        if let Err(reason) = feed(director, participant, &mut frames, &chunk[..n]) {
            return reason;
        }
    }
}

/// Push one recv's worth of bytes through the framing codec.
fn feed(
    director: &MessageDirector,
    participant: &Arc<Participant>,
    frames: &mut FrameBuffer,
    chunk: &[u8],
) -> std::result::Result<(), DisconnectReason> {
    match frames.take_exact(chunk) {
        Ok(Some(payload)) => {
            dispatch_frame(director, participant, &payload);
            return Ok(());
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(participant = %participant.name(), error = %e, "Framing violation");
            return Err(DisconnectReason::ProtocolError);
        }
    }

    frames.extend(chunk);
    loop {
        match frames.next_frame() {
            Ok(Some(payload)) => dispatch_frame(director, participant, &payload),
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(participant = %participant.name(), error = %e, "Framing violation");
                return Err(DisconnectReason::ProtocolError);
            }
        }
    }
}

fn dispatch_frame(director: &MessageDirector, participant: &Arc<Participant>, payload: &[u8]) {
    let dg = Datagram::from_bytes(payload).into_handle();
    director.dispatch(participant, dg);
}
