//! # Core session-engine types (RFC 8999, RFC 9000)
//!
//! Connection identifiers, stream-id helpers, endpoint side, and the
//! protocol constants shared by the session and socket layers.

use bytes::Bytes;
use core::time::Duration;

// ============================================================================
// Connection ID (RFC 9000 Section 5.1, RFC 8999 Section 5.3)
// ============================================================================

/// Maximum length of a Connection ID (20 bytes per RFC 9000 Section 17.2).
pub const MAX_CID_LENGTH: usize = 20;

/// Minimum length of a locally generated Connection ID.
pub const MIN_CID_LENGTH: usize = 1;

/// Length of the Connection IDs this endpoint generates for itself.
pub const LOCAL_CID_LENGTH: usize = 18;

/// Connection ID - opaque, version-independent routing identifier.
///
/// Zero-length CIDs are permitted on the wire but never generated locally.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Create a new ConnectionId from bytes.
    ///
    /// Returns None if length exceeds MAX_CID_LENGTH.
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies data).
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self {
            bytes: Bytes::copy_from_slice(slice),
        })
    }

    /// Generate a random CID of [`LOCAL_CID_LENGTH`] bytes.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut buf = [0u8; LOCAL_CID_LENGTH];
        rand::thread_rng().fill_bytes(&mut buf);
        Self {
            bytes: Bytes::copy_from_slice(&buf),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Create an empty (zero-length) connection ID.
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes[..] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

// ============================================================================
// Stateless reset token (RFC 9000 Section 10.3)
// ============================================================================

/// Length of a stateless reset token.
pub const STATELESS_RESET_TOKEN_LENGTH: usize = 16;

/// Length of the per-socket stateless reset secret.
pub const RESET_SECRET_LENGTH: usize = 16;

/// A stateless reset token: 16 opaque bytes that identify a defunct
/// connection without requiring key material.
pub type StatelessResetToken = [u8; STATELESS_RESET_TOKEN_LENGTH];

// ============================================================================
// Stream IDs (RFC 9000 Section 2.1)
// ============================================================================

/// Stream identifier. Signed so that -1 can denote "no stream" in the
/// serialization loop, matching the transport-library convention.
pub type StreamId = i64;

/// Stream direction, encoded in bit 1 of the stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Bidirectional,
    Unidirectional,
}

/// Stream origin, encoded in bit 0 of the stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    Client,
    Server,
}

/// Extract the direction of a stream from its id.
pub fn stream_direction(id: StreamId) -> StreamDirection {
    if id & 0x02 == 0 {
        StreamDirection::Bidirectional
    } else {
        StreamDirection::Unidirectional
    }
}

/// Extract the origin of a stream from its id.
pub fn stream_origin(id: StreamId) -> StreamOrigin {
    if id & 0x01 == 0 {
        StreamOrigin::Client
    } else {
        StreamOrigin::Server
    }
}

/// Whether the stream was initiated by this endpoint.
pub fn is_local_stream(side: Side, id: StreamId) -> bool {
    match stream_origin(id) {
        StreamOrigin::Client => side.is_client(),
        StreamOrigin::Server => side.is_server(),
    }
}

// ============================================================================
// Side (Client vs Server)
// ============================================================================

/// Connection endpoint side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        matches!(self, Side::Client)
    }

    pub fn is_server(self) -> bool {
        matches!(self, Side::Server)
    }
}

// ============================================================================
// Versions and wire constants
// ============================================================================

/// QUIC v1 (RFC 9000).
pub const VERSION_1: u32 = 0x0000_0001;

/// Reserved version number used by Version Negotiation packets.
pub const VERSION_NEGOTIATION: u32 = 0x0000_0000;

/// Minimum acceptable inbound Initial datagram (RFC 9000 Section 14.1).
/// Anything shorter is ignored without further processing.
pub const MIN_INITIAL_PACKET_SIZE: usize = 1200;

/// Maximum packet length used when serializing toward an IPv4 peer.
pub const MAX_PKTLEN_IPV4: usize = 1252;

/// Maximum packet length used when serializing toward an IPv6 peer.
pub const MAX_PKTLEN_IPV6: usize = 1232;

/// Maximum packet length for the given remote address family.
pub fn max_pktlen(remote: &std::net::SocketAddr) -> usize {
    match remote {
        std::net::SocketAddr::V4(_) => MAX_PKTLEN_IPV4,
        std::net::SocketAddr::V6(_) => MAX_PKTLEN_IPV6,
    }
}

// ============================================================================
// Defaults (transport parameters and socket limits)
// ============================================================================

pub const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;
pub const DEFAULT_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 256 * 1024;
pub const DEFAULT_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 256 * 1024;
pub const DEFAULT_MAX_STREAM_DATA_UNI: u64 = 256 * 1024;
pub const DEFAULT_MAX_DATA: u64 = 1024 * 1024;
pub const DEFAULT_MAX_STREAMS_BIDI: u64 = 100;
pub const DEFAULT_MAX_STREAMS_UNI: u64 = 3;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_MAX_CONNECTIONS: usize = usize::MAX >> 1;
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 100;
pub const DEFAULT_MAX_STATELESS_RESETS_PER_HOST: usize = 10;

/// Retry token lifetime bounds, in seconds.
pub const MIN_RETRY_TOKEN_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_RETRY_TOKEN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the validated-address LRU.
pub const MAX_VALIDATED_ADDRESS_LRU: usize = 10;

/// Application-level "no error" code (0xff00, from the reserved
/// greasing range so it never collides with a transport error).
pub const APP_NO_ERROR: u64 = 0xff00;

/// Transport-level NO_ERROR code.
pub const NO_ERROR: u64 = 0x0;

/// SERVER_BUSY / CONNECTION_REFUSED close code used by admission control.
pub const SERVER_BUSY: u64 = 0x2;
