//! Version-independent header parsing for socket dispatch (RFC 8999).
//!
//! The socket only needs enough of the header to route: header form, the
//! version, both CIDs, and (for Initial packets) the address-validation
//! token. Everything past that is the transport library's business.

use bytes::Bytes;
use quion_quic::types::{ConnectionId, MAX_CID_LENGTH};
use quion_quic::varint;

/// Long-header packet types (RFC 9000 Section 17.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

/// The dispatch-relevant slice of a packet header.
#[derive(Debug, Clone)]
pub enum PacketHeader {
    VersionNegotiation {
        dcid: ConnectionId,
        scid: ConnectionId,
    },
    Long {
        ty: LongType,
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        /// Present only on Initial packets; empty when the client sent none.
        token: Bytes,
    },
    Short {
        dcid: ConnectionId,
    },
}

impl PacketHeader {
    pub fn dcid(&self) -> &ConnectionId {
        match self {
            PacketHeader::VersionNegotiation { dcid, .. } => dcid,
            PacketHeader::Long { dcid, .. } => dcid,
            PacketHeader::Short { dcid } => dcid,
        }
    }

    pub fn is_initial(&self) -> bool {
        matches!(
            self,
            PacketHeader::Long {
                ty: LongType::Initial,
                ..
            }
        )
    }
}

/// Parse the invariant header fields. `local_cid_len` is the fixed length
/// of CIDs this endpoint generates, needed because short headers do not
/// encode the DCID length.
pub fn parse_header(data: &[u8], local_cid_len: usize) -> Option<PacketHeader> {
    let first = *data.first()?;

    // Fixed bit clear is only legal for Version Negotiation; everything
    // else with a clear fixed bit is garbage (or a stateless reset, which
    // is handled by token lookup, not header shape).
    if first & 0x80 == 0 {
        if data.len() < 1 + local_cid_len {
            return None;
        }
        let dcid = ConnectionId::from_slice(&data[1..1 + local_cid_len])?;
        return Some(PacketHeader::Short { dcid });
    }

    // Long header: flags, version, dcid len/value, scid len/value.
    if data.len() < 7 {
        return None;
    }
    let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let mut off = 5;

    let dcid_len = data[off] as usize;
    off += 1;
    if dcid_len > MAX_CID_LENGTH || data.len() < off + dcid_len + 1 {
        return None;
    }
    let dcid = ConnectionId::from_slice(&data[off..off + dcid_len])?;
    off += dcid_len;

    let scid_len = data[off] as usize;
    off += 1;
    if scid_len > MAX_CID_LENGTH || data.len() < off + scid_len {
        return None;
    }
    let scid = ConnectionId::from_slice(&data[off..off + scid_len])?;
    off += scid_len;

    if version == 0 {
        return Some(PacketHeader::VersionNegotiation { dcid, scid });
    }

    let ty = match (first >> 4) & 0x03 {
        0b00 => LongType::Initial,
        0b01 => LongType::ZeroRtt,
        0b10 => LongType::Handshake,
        _ => LongType::Retry,
    };

    let token = if ty == LongType::Initial {
        let (token_len, n) = varint::decode(&data[off..])?;
        off += n;
        let token_len = token_len as usize;
        if data.len() < off + token_len {
            return None;
        }
        Bytes::copy_from_slice(&data[off..off + token_len])
    } else {
        Bytes::new()
    };

    Some(PacketHeader::Long {
        ty,
        version,
        dcid,
        scid,
        token,
    })
}
