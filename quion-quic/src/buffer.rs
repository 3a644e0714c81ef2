//! Outbound byte queues with ack-driven consumption.
//!
//! [`QuicBuffer`] is a chunk list with two cursors: a *seek* cursor marking
//! bytes already handed to the transport library for serialization, and a
//! *consume* cursor freeing bytes the peer has acknowledged. Retransmission
//! requires that data stays resident between the two, so chunks are only
//! released by [`QuicBuffer::consume`] (or wholesale by
//! [`QuicBuffer::cancel`]).
//!
//! [`QuicPacket`] is one serialized datagram on its way to an endpoint.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

// ============================================================================
// QuicBuffer
// ============================================================================

#[derive(Debug)]
struct Chunk {
    data: Bytes,
    /// Bytes of this chunk already handed to the transport for sending.
    seek: usize,
    /// Bytes of this chunk acknowledged and logically freed.
    consumed: usize,
}

impl Chunk {
    fn new(data: Bytes) -> Self {
        Self {
            data,
            seek: 0,
            consumed: 0,
        }
    }

    fn unsent(&self) -> &[u8] {
        &self.data[self.seek..]
    }

    fn unconsumed(&self) -> usize {
        self.data.len() - self.consumed
    }
}

/// An append-only outbound byte queue consumed by acknowledgements.
#[derive(Debug, Default)]
pub struct QuicBuffer {
    chunks: VecDeque<Chunk>,
    /// Total unconsumed bytes across all chunks.
    length: usize,
    /// Total unsent bytes across all chunks.
    remaining: usize,
    ended: bool,
}

impl QuicBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. The buffer takes its own reference so the caller's
    /// storage is never aliased by a later retransmission.
    pub fn push(&mut self, data: Bytes) {
        debug_assert!(!self.ended, "push after end");
        if data.is_empty() {
            return;
        }
        self.length += data.len();
        self.remaining += data.len();
        self.chunks.push_back(Chunk::new(data));
    }

    /// Mark the buffer complete: no further pushes will follow. Used to
    /// derive the fin flag when the queue drains.
    pub fn end(&mut self) {
        self.ended = true;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Unconsumed (unacknowledged) bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes not yet handed to the transport.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Collect up to `max_chunks` unsent slices for a vectored write.
    pub fn peek_unsent<'a>(&'a self, max_chunks: usize) -> Vec<&'a [u8]> {
        let mut out = Vec::new();
        for chunk in &self.chunks {
            if out.len() == max_chunks {
                break;
            }
            let slice = chunk.unsent();
            if !slice.is_empty() {
                out.push(slice);
            }
        }
        out
    }

    /// Advance the seek cursor by `amount` bytes: they were handed to the
    /// transport and must now be retained for retransmission. Returns the
    /// number of bytes actually advanced.
    pub fn seek(&mut self, mut amount: usize) -> usize {
        let mut advanced = 0;
        for chunk in self.chunks.iter_mut() {
            if amount == 0 {
                break;
            }
            let avail = chunk.data.len() - chunk.seek;
            let step = avail.min(amount);
            chunk.seek += step;
            amount -= step;
            advanced += step;
        }
        self.remaining -= advanced;
        advanced
    }

    /// Free the oldest `amount` bytes following an acknowledgement. Fully
    /// consumed chunks are dropped; a partially consumed head stays in
    /// place. Returns the number of bytes freed.
    pub fn consume(&mut self, amount: usize) -> usize {
        let mut to_free = amount.min(self.length);
        let freed = to_free;
        while to_free > 0 {
            let chunk = match self.chunks.front_mut() {
                Some(c) => c,
                None => break,
            };
            let step = chunk.unconsumed().min(to_free);
            chunk.consumed += step;
            // Consumption implies transmission; keep the cursors coherent
            // if an ack covers bytes we never counted as sent.
            if chunk.seek < chunk.consumed {
                self.remaining -= chunk.consumed - chunk.seek;
                chunk.seek = chunk.consumed;
            }
            to_free -= step;
            self.length -= step;
            if chunk.unconsumed() == 0 {
                self.chunks.pop_front();
            }
        }
        freed
    }

    /// Drop everything still buffered, returning the number of bytes that
    /// had never been acknowledged. A non-zero return at teardown indicates
    /// data the peer never confirmed.
    pub fn cancel(&mut self) -> usize {
        let leaked = self.length;
        self.chunks.clear();
        self.length = 0;
        self.remaining = 0;
        leaked
    }
}

// ============================================================================
// QuicPacket
// ============================================================================

/// One serialized QUIC datagram awaiting transmission.
///
/// The transport library fills the packet's buffer and the caller truncates
/// it to the written length before queuing it toward an endpoint. The
/// diagnostic label differentiates send paths in trace output.
#[derive(Debug, Clone)]
pub struct QuicPacket {
    data: BytesMut,
    label: &'static str,
}

impl QuicPacket {
    pub fn new(label: &'static str, capacity: usize) -> Self {
        let mut data = BytesMut::with_capacity(capacity);
        data.resize(capacity, 0);
        Self { data, label }
    }

    /// Truncate to the length actually serialized.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.data.truncate(len);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}
