//! Per-session streams and the stream table.
//!
//! A stream is created lazily: by the local host opening it, or on the
//! first non-empty STREAM frame from the peer. Its outbound side is a
//! [`QuicBuffer`] drained into vectored writes by the session's send loop;
//! once the buffer is ended and fully handed off, the fin travels with the
//! last chunk and `fin_sent` latches.

use bytes::Bytes;
use std::collections::HashMap;

use crate::buffer::QuicBuffer;
use crate::types::{stream_direction, stream_origin, StreamDirection, StreamId, StreamOrigin};

/// Maximum chunks gathered into one vectored stream write.
pub const MAX_WRITE_VECTOR: usize = 16;

/// One QUIC stream owned by a session.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    outbound: QuicBuffer,
    /// Writable until the host ends the stream (or it is reset/shut).
    writable: bool,
    /// Latched once the fin has been handed to the transport library.
    fin_sent: bool,
    /// Whether the stream was ever open for writing (uni inbound never is).
    ever_writable: bool,
    /// Highest inbound offset delivered to the host.
    recv_offset: u64,
    /// Final size reported by a peer RESET_STREAM.
    final_size: Option<u64>,
    /// Application error code from reset/close, if any.
    app_error_code: Option<u64>,
}

impl Stream {
    pub fn new(id: StreamId, writable: bool) -> Self {
        Self {
            id,
            outbound: QuicBuffer::new(),
            writable,
            fin_sent: false,
            ever_writable: writable,
            recv_offset: 0,
            final_size: None,
            app_error_code: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn direction(&self) -> StreamDirection {
        stream_direction(self.id)
    }

    pub fn origin(&self) -> StreamOrigin {
        stream_origin(self.id)
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_fin_sent(&self) -> bool {
        self.fin_sent
    }

    pub fn was_ever_writable(&self) -> bool {
        self.ever_writable
    }

    pub fn recv_offset(&self) -> u64 {
        self.recv_offset
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    pub fn app_error_code(&self) -> Option<u64> {
        self.app_error_code
    }

    /// Queue outbound data. Ignored once the stream is no longer writable.
    pub fn write(&mut self, data: Bytes) -> bool {
        if !self.writable {
            return false;
        }
        self.outbound.push(data);
        true
    }

    /// End the write side; the fin travels with the last queued chunk.
    pub fn end(&mut self) {
        if self.writable {
            self.writable = false;
            self.outbound.end();
        }
    }

    /// Force-close the write side without fin semantics (reset/shutdown).
    pub fn shut_write(&mut self, code: u64) {
        self.writable = false;
        self.app_error_code = Some(code);
        self.outbound.cancel();
    }

    /// Unsent chunks for the next vectored write.
    pub fn pending_chunks(&self) -> Vec<&[u8]> {
        self.outbound.peek_unsent(MAX_WRITE_VECTOR)
    }

    /// Whether the send loop still has work for this stream: unsent bytes,
    /// or a fin that has not been serialized yet.
    pub fn wants_send(&self) -> bool {
        self.outbound.remaining() > 0 || (!self.writable && self.ever_writable && !self.fin_sent)
    }

    /// The fin flag for the next write: set when this is the last of the
    /// queued data and the host has ended the stream.
    pub fn fin_for_next_write(&self) -> bool {
        !self.writable && self.ever_writable
    }

    /// Commit `amount` bytes the transport library consumed.
    pub fn commit(&mut self, amount: usize) {
        self.outbound.seek(amount);
    }

    /// Called after a write pass; latches `fin_sent` once everything
    /// (including the fin) has been handed off.
    pub fn mark_fin_sent(&mut self) {
        debug_assert!(!self.writable);
        self.fin_sent = true;
    }

    /// Peer acknowledged `datalen` stream bytes; free them.
    pub fn acknowledge(&mut self, datalen: usize) {
        self.outbound.consume(datalen);
    }

    /// Record delivery of an inbound chunk ending at `offset + len`.
    pub fn record_recv(&mut self, offset: u64, len: usize) {
        self.recv_offset = self.recv_offset.max(offset + len as u64);
    }

    pub fn set_final_size(&mut self, final_size: u64) {
        self.final_size = Some(final_size);
    }

    /// Unacknowledged outbound bytes.
    pub fn unacked(&self) -> usize {
        self.outbound.len()
    }
}

/// The per-session stream table, iterated in insertion order by the send
/// loop. (Priority scheduling is a future extension.)
#[derive(Debug, Default)]
pub struct StreamMap {
    streams: HashMap<StreamId, Stream>,
    order: Vec<StreamId>,
}

impl StreamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stream: Stream) {
        let id = stream.id();
        if self.streams.insert(id, stream).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        let removed = self.streams.remove(&id);
        if removed.is_some() {
            self.order.retain(|&sid| sid != id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Stream ids in insertion order.
    pub fn ids(&self) -> Vec<StreamId> {
        self.order.clone()
    }
}
