//! The transport-library contract.
//!
//! The session engine does not parse or serialize QUIC packets itself; it
//! drives a lower-level protocol library through [`TransportConnection`].
//! Packet intake ([`TransportConnection::read_packet`]) surfaces protocol
//! events through an event queue that the session dispatches after the call
//! returns. The session marks itself "inside a transport callback" for the
//! duration of that dispatch, and no send-capable routine may run until the
//! marker is released.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{PreferredAddress, TransportParams};
use crate::crypto::CryptoLevel;
use crate::error::QuicError;
use crate::listener::PathValidationResult;
use crate::types::{ConnectionId, StatelessResetToken, StreamId};

// ============================================================================
// Errors and outcomes
// ============================================================================

/// Failure codes surfaced by the transport library.
///
/// `Draining` and `RecvVersionNegotiation` are non-fatal intake outcomes;
/// everything else terminates the operation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The packet-number space is exhausted; only a silent close remains.
    PktNumExhausted,
    /// The stream is flow-control blocked.
    StreamDataBlocked,
    /// The stream's write side is already shut.
    StreamShutWr,
    /// The stream id does not exist in the transport library.
    StreamNotFound,
    /// The peer sent CONNECTION_CLOSE; the connection entered draining.
    Draining,
    /// A Version Negotiation packet was received.
    RecvVersionNegotiation,
    /// Server intake requires address validation via a Retry packet.
    RequiresRetry,
    /// The stream limit prevents opening another stream.
    StreamLimit,
    /// The operation is invalid in the connection's current state.
    InvalidState,
    /// A callback handler reported failure.
    CallbackFailure,
    /// Any other transport-library error, by its native code.
    Other(i32),
}

impl TransportError {
    /// Native errno-style code, for the last-error descriptor.
    pub fn code(&self) -> i32 {
        match self {
            TransportError::PktNumExhausted => -203,
            TransportError::StreamDataBlocked => -210,
            TransportError::StreamShutWr => -221,
            TransportError::StreamNotFound => -222,
            TransportError::Draining => -275,
            TransportError::RecvVersionNegotiation => -229,
            TransportError::RequiresRetry => -526,
            TransportError::StreamLimit => -219,
            TransportError::InvalidState => -226,
            TransportError::CallbackFailure => -502,
            TransportError::Other(code) => *code,
        }
    }
}

/// Outcome of one vectored stream write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamWrite {
    /// Bytes serialized into the packet buffer. Zero means the connection
    /// is congestion limited (or has nothing to send).
    pub packet_len: usize,
    /// Stream bytes consumed from the input vector, if any.
    pub consumed: Option<usize>,
}

/// RTT snapshot pulled from the transport library's recovery state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub min_rtt_us: u64,
    pub latest_rtt_us: u64,
    pub smoothed_rtt_us: u64,
}

/// A network path: the local/remote address pair a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Path {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

// ============================================================================
// Connection events (transport callbacks)
// ============================================================================

/// Events raised by the transport library while processing a packet.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// Client only: the connection wants its first flight of crypto data.
    ClientInitial,
    /// Server only: a client Initial arrived; install keys for `dcid`.
    ReceiveClientInitial { dcid: ConnectionId },
    /// Peer handshake bytes for the TLS provider.
    CryptoData {
        level: CryptoLevel,
        offset: u64,
        data: Bytes,
    },
    /// The peer acknowledged `datalen` crypto bytes at `level`.
    AckedCryptoOffset { level: CryptoLevel, datalen: usize },
    /// The TLS handshake completed.
    HandshakeCompleted,
    /// The peer confirmed the handshake.
    HandshakeConfirmed,
    /// A chunk of stream data arrived.
    StreamData {
        stream_id: StreamId,
        fin: bool,
        offset: u64,
        data: Bytes,
    },
    /// The peer opened a stream (no resources are committed yet).
    StreamOpen { stream_id: StreamId },
    /// A stream fully closed.
    StreamClose {
        stream_id: StreamId,
        app_error_code: u64,
    },
    /// The peer reset a stream.
    StreamReset {
        stream_id: StreamId,
        final_size: u64,
        app_error_code: u64,
    },
    /// The peer acknowledged stream data.
    AckedStreamDataOffset {
        stream_id: StreamId,
        offset: u64,
        datalen: usize,
    },
    /// The transport library activated a new local CID.
    NewConnectionId {
        cid: ConnectionId,
        reset_token: StatelessResetToken,
    },
    /// The transport library retired a local CID.
    RemoveConnectionId {
        cid: ConnectionId,
        reset_token: StatelessResetToken,
    },
    /// A path validation attempt concluded.
    PathValidation {
        result: PathValidationResult,
        local: SocketAddr,
        remote: SocketAddr,
    },
    /// Client only: the peer answered with Version Negotiation.
    VersionNegotiation { requested: u32, versions: Vec<u32> },
    /// A valid stateless reset for this connection was received.
    StatelessReset,
    /// Client only: a Retry packet was received; the handshake restarts.
    Retry,
    /// The peer initiated a key update; new application secrets are active.
    KeyUpdate { rx_secret: Bytes, tx_secret: Bytes },
    /// The server advertised a preferred address.
    SelectPreferredAddress { preferred: PreferredAddress },
}

// ============================================================================
// Connection-ID generation
// ============================================================================

/// Produces connection IDs and their stateless reset tokens.
///
/// The socket supplies an implementation keyed with its per-socket reset
/// secret; the transport library calls through it whenever it needs a fresh
/// CID, then raises [`ConnEvent::NewConnectionId`] so the session can
/// register the result.
pub trait CidGenerator: Send + Sync {
    fn generate_cid(&self) -> ConnectionId;
    fn reset_token(&self, cid: &ConnectionId) -> StatelessResetToken;
}

// ============================================================================
// The connection itself
// ============================================================================

/// Handle to one transport-library connection.
///
/// All methods take `&mut self`; the session serializes access on its loop.
pub trait TransportConnection: Send {
    /// Feed one received datagram. Protocol events are appended to
    /// `events` for the caller to dispatch after this returns.
    fn read_packet(
        &mut self,
        path: &Path,
        data: &[u8],
        now: Instant,
        events: &mut Vec<ConnEvent>,
    ) -> Result<(), TransportError>;

    /// Serialize up to one packet of stream data into `buf`.
    ///
    /// `stream_id` of None serializes only non-stream frames (acks, probe
    /// packets, handshake completion). `fin` marks the final stream chunk.
    fn writev_stream(
        &mut self,
        buf: &mut [u8],
        stream_id: Option<StreamId>,
        data: &[&[u8]],
        fin: bool,
        now: Instant,
    ) -> Result<StreamWrite, TransportError>;

    /// Serialize a CONNECTION_CLOSE for the given error into `buf`,
    /// entering the closing period. The frame variant follows the error
    /// family (transport vs application close).
    fn write_connection_close(
        &mut self,
        buf: &mut [u8],
        error: QuicError,
        now: Instant,
    ) -> Result<usize, TransportError>;

    /// Submit outbound handshake bytes at a crypto level. The caller keeps
    /// the bytes alive until they are acknowledged.
    fn submit_crypto_data(&mut self, level: CryptoLevel, data: Bytes)
        -> Result<(), TransportError>;

    /// Install traffic secrets for a crypto level.
    fn install_secrets(
        &mut self,
        level: CryptoLevel,
        rx_secret: Bytes,
        tx_secret: Bytes,
    ) -> Result<(), TransportError>;

    /// Begin a local key update with the already-derived secrets.
    fn initiate_key_update(
        &mut self,
        rx_secret: Bytes,
        tx_secret: Bytes,
        now: Instant,
    ) -> Result<(), TransportError>;

    /// (Re-)derive and install initial keys against `dcid`. Used at server
    /// intake and when a client handles a Retry.
    fn install_initial_key(&mut self, dcid: &ConnectionId) -> Result<(), TransportError>;

    /// Queue RESET_STREAM / STOP_SENDING as appropriate for the stream.
    fn shutdown_stream(&mut self, stream_id: StreamId, code: u64) -> Result<(), TransportError>;

    /// Shut only the read side of a stream.
    fn shutdown_stream_read(&mut self, stream_id: StreamId, code: u64)
        -> Result<(), TransportError>;

    fn open_bidi_stream(&mut self) -> Result<StreamId, TransportError>;
    fn open_uni_stream(&mut self) -> Result<StreamId, TransportError>;

    /// Whether this endpoint initiated the stream.
    fn is_local_stream(&self, stream_id: StreamId) -> bool;

    /// Extend connection-level flow control after data was delivered.
    fn extend_max_offset(&mut self, amount: u64);

    /// Extend stream-level flow control after the application consumed data.
    fn extend_max_stream_offset(&mut self, stream_id: StreamId, amount: u64);

    /// Re-credit peer stream limits after a remote stream is removed.
    fn extend_max_streams_bidi(&mut self, n: u64);
    fn extend_max_streams_uni(&mut self, n: u64);

    fn is_in_closing_period(&self) -> bool;
    fn is_in_draining_period(&self) -> bool;

    /// Absolute idle-timeout expiry.
    fn idle_expiry(&self) -> Instant;

    /// Next loss-detection expiry, if armed.
    fn loss_detection_expiry(&self) -> Option<Instant>;

    /// Next delayed-ack expiry, if armed.
    fn ack_delay_expiry(&self) -> Option<Instant>;

    /// Earliest of the retransmit-relevant expiries.
    fn next_expiry(&self) -> Option<Instant>;

    /// Loss-detection timer fired; run the recovery machinery.
    fn on_loss_detection_timeout(&mut self, now: Instant) -> Result<(), TransportError>;

    /// Ack-delay timer fired; flush the delayed acknowledgement.
    fn cancel_expired_ack_delay(&mut self, now: Instant);

    /// All source CIDs currently routed to this connection.
    fn source_cids(&self) -> Vec<ConnectionId>;

    /// The current destination CID.
    fn dcid(&self) -> ConnectionId;

    /// Reset tokens associated with the active destination CIDs.
    fn active_reset_tokens(&self) -> Vec<StatelessResetToken>;

    fn local_transport_params(&self) -> TransportParams;
    fn remote_transport_params(&self) -> Option<TransportParams>;

    /// Replay remembered peer parameters before the handshake (0-RTT).
    fn set_early_remote_transport_params(&mut self, params: &TransportParams);

    fn negotiated_version(&self) -> u32;

    /// Connection-level flow-control credit left for sending.
    fn max_data_left(&self) -> u64;

    fn bytes_in_flight(&self) -> u64;

    fn recovery_stats(&self) -> RecoveryStats;

    /// Client only: migrate onto a new path (socket change).
    fn initiate_migration(&mut self, path: &Path, now: Instant) -> Result<(), TransportError>;
}

/// Inputs for creating a server-side transport connection.
pub struct ServerSetup<'a> {
    /// The client's source CID (our destination).
    pub dcid: ConnectionId,
    /// Our chosen source CID.
    pub scid: ConnectionId,
    /// Original DCID from the first Initial, when a Retry was performed.
    pub ocid: Option<ConnectionId>,
    pub version: u32,
    pub path: Path,
    pub params: &'a TransportParams,
    pub cid_generator: Arc<dyn CidGenerator>,
}

/// Inputs for creating a client-side transport connection.
pub struct ClientSetup<'a> {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub version: u32,
    pub path: Path,
    pub params: &'a TransportParams,
    pub cid_generator: Arc<dyn CidGenerator>,
}

/// Creates transport-library connections for the socket, and serializes
/// the stateless packets the socket emits without per-connection state
/// (Retry, Version Negotiation, Stateless Reset, and the immediate
/// CONNECTION_CLOSE used to refuse an Initial).
pub trait TransportFactory: Send + Sync {
    fn new_server(&self, setup: ServerSetup<'_>) -> Box<dyn TransportConnection>;
    fn new_client(&self, setup: ClientSetup<'_>) -> Box<dyn TransportConnection>;

    /// Serialize a Version Negotiation packet listing `versions`.
    fn write_version_negotiation(
        &self,
        buf: &mut [u8],
        dcid: &ConnectionId,
        scid: &ConnectionId,
        versions: &[u32],
    ) -> Result<usize, TransportError>;

    /// Serialize a Retry packet carrying an address-validation token.
    fn write_retry(
        &self,
        buf: &mut [u8],
        version: u32,
        dcid: &ConnectionId,
        scid: &ConnectionId,
        odcid: &ConnectionId,
        token: &[u8],
    ) -> Result<usize, TransportError>;

    /// Serialize a Stateless Reset whose trailing 16 bytes are `token`.
    /// `pad_to` bounds the unpredictable padding prefix.
    fn write_stateless_reset(
        &self,
        buf: &mut [u8],
        token: &StatelessResetToken,
        pad_to: usize,
    ) -> Result<usize, TransportError>;

    /// Serialize a connection-less CONNECTION_CLOSE refusing an Initial.
    fn write_immediate_close(
        &self,
        buf: &mut [u8],
        version: u32,
        dcid: &ConnectionId,
        scid: &ConnectionId,
        code: u64,
    ) -> Result<usize, TransportError>;
}
