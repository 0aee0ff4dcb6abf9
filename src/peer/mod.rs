//! The framed peer abstraction: write-side aggregation, read-side framing,
//! and idempotent shutdown (§4.1).

pub mod socket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use tracing::Instrument;

use crate::async_runtime as rt;
use crate::config::AggregationOptions;
use crate::error::{Error, ErrorKind, Result};
use crate::wire::{self, Frame, ProtocolVersion};

pub use socket::{connect_tcp, connect_unix, Listener, Socket};

/// Reads one complete length-prefixed frame from `socket` and returns its
/// body (kind byte onward, length prefix stripped). Used only for the
/// handshake exchanges that precede a connection's steady-state framing
/// (`Peer::spawn`); unlike the steady-state reader this allocates per call
/// since handshake traffic is low-volume and short-lived.
pub async fn read_framed(socket: &mut Socket) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; wire::LENGTH_PREFIX_LEN];
    socket.read_exact(&mut len_buf).await.map_err(|e| Error::wrapped(ErrorKind::Connection, e))?;
    let total = u32::from_le_bytes(len_buf);
    if (total as usize) < wire::LENGTH_PREFIX_LEN || total > wire::MAX_FRAME_LEN {
        return Err(Error::msg(ErrorKind::Protocol, "out-of-bounds frame length during handshake"));
    }
    let mut body = vec![0u8; total as usize - wire::LENGTH_PREFIX_LEN];
    socket.read_exact(&mut body).await.map_err(|e| Error::wrapped(ErrorKind::Connection, e))?;
    Ok(body)
}

/// Writes one length-prefixed frame (`body` is the kind byte onward) to
/// `socket`. See [`read_framed`].
pub async fn write_framed(socket: &mut Socket, body: &[u8]) -> Result<()> {
    socket.write_all(&frame_with_length(body)).await.map_err(|e| Error::wrapped(ErrorKind::Connection, e))
}

/// Classifies a payload for the purposes of write-side aggregation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendKind {
    /// A user payload (`MwMsg`/`SimMsg`); eligible for aggregation.
    UserData,
    /// A message that must flush any pending aggregation buffer ahead of
    /// itself: `NextSimTask`, `ParticipantStatus`.
    FlushAggregation,
    /// Everything else: control-plane traffic sent immediately.
    Direct,
}

struct Aggregation {
    buf: Vec<u8>,
    flush_task: Option<tokio::task::JoinHandle<()>>,
}

/// A single connected peer: owns the write queue, the aggregation buffer,
/// and the read-side framing loop.
pub struct Peer {
    negotiated: ProtocolVersion,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    agg: Mutex<Aggregation>,
    agg_opts: AggregationOptions,
    shutdown: AtomicBool,
    on_shutdown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    weak_self: Mutex<Option<Weak<Peer>>>,
}

impl Peer {
    /// Splits `socket` into owned read/write halves, spawns the writer task,
    /// and returns the peer handle plus a channel of decoded inbound frames.
    pub fn spawn(
        socket: Socket,
        negotiated: ProtocolVersion,
        agg_opts: AggregationOptions,
    ) -> (Arc<Peer>, mpsc::UnboundedReceiver<Frame>) {
        let (read_half, write_half) = tokio::io::split(socket);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let peer = Arc::new(Peer {
            negotiated,
            write_tx,
            agg: Mutex::new(Aggregation { buf: Vec::new(), flush_task: None }),
            agg_opts,
            shutdown: AtomicBool::new(false),
            on_shutdown: Mutex::new(None),
            weak_self: Mutex::new(None),
        });
        *peer.weak_self.lock() = Some(Arc::downgrade(&peer));

        let span = tracing::info_span!("peer", version = ?negotiated);
        rt::spawn(writer_loop(write_half, write_rx).instrument(span.clone()));
        rt::spawn(reader_loop(read_half, negotiated, inbound_tx, peer.clone()).instrument(span));

        (peer, inbound_rx)
    }

    pub fn negotiated_version(&self) -> ProtocolVersion {
        self.negotiated
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Registers the one-shot callback fired when this peer shuts down.
    /// Overwrites any previously registered callback.
    pub fn set_on_shutdown(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_shutdown.lock() = Some(Box::new(f));
    }

    /// Sends an already wire-encoded frame body (kind byte onward, without
    /// the length prefix), applying the aggregation policy for `kind`.
    pub fn send_message(&self, body: Vec<u8>, kind: SendKind) -> Result<()> {
        if self.is_shutdown() {
            return Ok(());
        }

        if body.is_empty() {
            return Err(Error::msg(ErrorKind::Protocol, "refusing to send a zero-length frame"));
        }
        if body.len() as u64 + wire::LENGTH_PREFIX_LEN as u64 > wire::MAX_FRAME_LEN as u64 {
            return Err(Error::msg(ErrorKind::Protocol, "refusing to send an oversized frame"));
        }

        match kind {
            SendKind::UserData if self.agg_opts.enable_message_aggregation => {
                self.append_to_aggregation(body);
                Ok(())
            }
            SendKind::FlushAggregation => {
                self.append_to_aggregation(body);
                self.flush_aggregation();
                Ok(())
            }
            _ => self.enqueue_framed(body),
        }
    }

    fn append_to_aggregation(&self, body: Vec<u8>) {
        let mut agg = self.agg.lock();
        agg.buf.extend_from_slice(&frame_with_length(&body));

        if agg.flush_task.is_none() {
            if let Some(peer) = self.weak_self.lock().as_ref().and_then(Weak::upgrade) {
                let timeout = self.agg_opts.flush_timeout;
                agg.flush_task = Some(rt::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    peer.flush_aggregation();
                }));
            }
        }

        if agg.buf.len() >= self.agg_opts.aggregation_buffer_threshold {
            drop(agg);
            self.flush_aggregation();
        }
    }

    fn flush_aggregation(&self) {
        let drained = {
            let mut agg = self.agg.lock();
            if let Some(task) = agg.flush_task.take() {
                task.abort();
            }
            std::mem::take(&mut agg.buf)
        };
        if drained.is_empty() {
            return;
        }
        let _ = self.write_tx.send(drained);
    }

    fn enqueue_framed(&self, body: Vec<u8>) -> Result<()> {
        self.write_tx
            .send(frame_with_length(&body))
            .map_err(|_| Error::msg(ErrorKind::Connection, "peer write queue is closed"))
    }

    /// Idempotent. Drops the pending aggregation buffer, cancels the flush
    /// timer, stops the writer task, and fires the shutdown callback once.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut agg = self.agg.lock();
            agg.buf.clear();
            if let Some(task) = agg.flush_task.take() {
                task.abort();
            }
        }
        if let Some(f) = self.on_shutdown.lock().take() {
            f();
        }
    }
}

/// `frame_with_length` prepends the `u32` little-endian total length to an
/// already-encoded frame body.
fn frame_with_length(body: &[u8]) -> Vec<u8> {
    let total = body.len() + wire::LENGTH_PREFIX_LEN;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

async fn writer_loop(mut write_half: WriteHalf<Socket>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(framed) = rx.recv().await {
        if write_half.write_all(&framed).await.is_err() {
            break;
        }
    }
}

async fn reader_loop(
    mut read_half: ReadHalf<Socket>,
    negotiated: ProtocolVersion,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    peer: Arc<Peer>,
) {
    let mut ring = BytesMut::with_capacity(64 * 1024);
    let mut chunk = [0u8; 16 * 1024];

    loop {
        while let Some(frame_len) = peek_complete_frame(&ring) {
            if frame_len < wire::LENGTH_PREFIX_LEN as u32 || frame_len > wire::MAX_FRAME_LEN {
                tracing::warn!(frame_len, "peer sent an out-of-bounds frame length, closing");
                peer.shutdown();
                return;
            }
            let mut body = ring.split_to(frame_len as usize);
            body.advance(wire::LENGTH_PREFIX_LEN);

            match wire::decode_frame(&body, negotiated) {
                Ok(frame) => {
                    if inbound_tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable frame from peer");
                }
            }
        }

        match read_half.read(&mut chunk).await {
            Ok(0) => {
                peer.shutdown();
                return;
            }
            Ok(n) => ring.extend_from_slice(&chunk[..n]),
            Err(_) => {
                peer.shutdown();
                return;
            }
        }
    }
}

/// Returns the total frame length (prefix included) if `ring` already holds
/// a complete frame.
fn peek_complete_frame(ring: &BytesMut) -> Option<u32> {
    if ring.len() < wire::LENGTH_PREFIX_LEN {
        return None;
    }
    let len = u32::from_le_bytes(ring[..4].try_into().unwrap());
    if (ring.len() as u64) < len as u64 {
        return None;
    }
    Some(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_with_length_prepends_total_length() {
        let body = vec![1, 2, 3];
        let framed = frame_with_length(&body);
        assert_eq!(&framed[..4], &7u32.to_le_bytes());
        assert_eq!(&framed[4..], &body[..]);
    }

    #[test]
    fn peek_complete_frame_waits_for_full_body() {
        let mut ring = BytesMut::new();
        ring.extend_from_slice(&7u32.to_le_bytes());
        ring.extend_from_slice(&[1, 2]);
        assert_eq!(peek_complete_frame(&ring), None);
        ring.extend_from_slice(&[3]);
        assert_eq!(peek_complete_frame(&ring), Some(7));
    }
}
