//! The listener surface: how the embedding host observes a session.
//!
//! Every hook has a default no-op implementation so hosts only override the
//! events they care about. For a given session, hooks are invoked in the
//! order the underlying events occurred; a listener must tolerate hooks
//! firing after it has initiated teardown (the session checks `destroyed`
//! before most, but late callbacks can still race a drop).

use bytes::Bytes;
use std::net::SocketAddr;

use crate::error::QuicError;
use crate::types::StreamId;

/// Details snapshotted from the TLS provider when the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub servername: String,
    pub alpn: String,
    pub cipher: String,
    pub cipher_version: String,
    pub negotiated_version: u32,
    pub max_packet_length: usize,
    pub verify_error_reason: Option<String>,
    pub verify_error_code: i64,
}

/// Result of a path validation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathValidationResult {
    Success,
    Failure,
}

/// Session-ticket payload for 0-RTT resumption: the serialized ticket plus
/// the transport-parameter blob to replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub ticket: Bytes,
    pub transport_params: Bytes,
}

/// Observer contract for a single session.
pub trait SessionListener {
    /// TLS keylog line (NSS key log format, newline not included).
    fn on_keylog(&mut self, _line: &str) {}

    /// Server only: a ClientHello arrived and the handshake is paused until
    /// the host resumes it (`Session::on_client_hello_done`).
    fn on_client_hello(&mut self, _alpn: &str, _servername: &str, _ciphers: &[String]) {}

    /// Server only: the client requested OCSP; handshake paused until
    /// `Session::on_cert_done`.
    fn on_cert(&mut self, _servername: &str) {}

    /// Client only: the server supplied an OCSP response.
    fn on_ocsp_response(&mut self, _response: Bytes) {}

    /// The TLS handshake completed and the peer identity was verified.
    fn on_handshake_completed(&mut self, _info: &HandshakeInfo) {}

    /// The handshake has additionally been confirmed by the peer.
    fn on_handshake_confirmed(&mut self) {}

    /// A path validation attempt concluded.
    fn on_path_validation(
        &mut self,
        _result: PathValidationResult,
        _local: SocketAddr,
        _remote: SocketAddr,
    ) {
    }

    /// The server advertised a preferred address and policy selected it.
    fn on_use_preferred_address(&mut self, _remote: SocketAddr) {}

    /// The peer answered with a Version Negotiation packet.
    fn on_version_negotiation(&mut self, _requested: u32, _peer_versions: &[u32], _local: &[u32]) {}

    /// The session closed without sending any frames.
    fn on_silent_close(&mut self, _stateless_reset: bool, _error: QuicError) {}

    /// The session entered the closing period with the given error.
    fn on_close(&mut self, _error: QuicError) {}

    /// The session object is gone; no further hooks will fire.
    fn on_destroyed(&mut self) {}

    /// A TLS session ticket usable for 0-RTT resumption was issued.
    fn on_session_ticket(&mut self, _ticket: SessionTicket) {}

    /// A new stream is ready (peer-initiated with data, or locally opened).
    fn on_stream_ready(&mut self, _stream_id: StreamId) {}

    /// Inbound stream data. `fin` marks the final chunk.
    fn on_stream_data(&mut self, _stream_id: StreamId, _data: Bytes, _fin: bool) {}

    /// A stream fully closed.
    fn on_stream_close(&mut self, _stream_id: StreamId, _app_error_code: u64) {}

    /// The peer reset a stream.
    fn on_stream_reset(&mut self, _stream_id: StreamId, _app_error_code: u64, _final_size: u64) {}

    /// A stream is flow-control blocked.
    fn on_stream_blocked(&mut self, _stream_id: StreamId) {}
}

/// Listener that ignores every event.
#[derive(Debug, Default)]
pub struct NullListener;

impl SessionListener for NullListener {}
