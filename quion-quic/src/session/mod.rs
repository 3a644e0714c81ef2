//! # The QUIC session state machine
//!
//! A session drives one connection through handshake, data transport, key
//! update, migration, and teardown. It mediates between the transport
//! library (packets and protocol callbacks), the TLS provider (keying
//! material), and the host-visible surface of streams and listener events.
//!
//! ## Closing, draining, silent close
//!
//! Three teardown shapes with distinct rules:
//!
//! - **Immediate close** enters the closing period: a CONNECTION_CLOSE is
//!   serialized once and retransmitted (bounded, with backoff) in response
//!   to inbound packets.
//! - **Draining** is entered when the *peer* closes; nothing may be sent.
//! - **Silent close** tears down without emitting a single frame. Used for
//!   idle timeout, packet-number exhaustion, and stateless reset.
//!
//! `destroyed` is terminal and orthogonal: reached from any of the above.
//!
//! ## Re-entrancy
//!
//! While transport events are being dispatched the session is "inside a
//! transport callback": every send-capable routine checks the marker and
//! queues intent instead of serializing, and the flush happens after the
//! dispatch loop returns.

mod stats;

pub use stats::{AckLatencyHistogram, SessionStats};

use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

use crate::buffer::QuicPacket;
use crate::config::{ClientConfig, PreferredAddressPolicy, TransportParams};
use crate::crypto::{CryptoContext, CryptoLevel, HandshakePause, TlsSession};
use crate::error::{ErrorFamily, QuicError, SessionError};
use crate::listener::{HandshakeInfo, PathValidationResult, SessionListener, SessionTicket};
use crate::stream::{Stream, StreamMap};
use crate::timer::Timer;
use crate::transport::{ConnEvent, Path, StreamWrite, TransportConnection, TransportError};
use crate::types::{
    max_pktlen, stream_direction, ConnectionId, Side, StatelessResetToken, StreamDirection,
    StreamId, StreamOrigin, APP_NO_ERROR, NO_ERROR,
};

/// Maximum packets serialized per `send_pending` pass.
const MAX_PACKETS_PER_SEND: usize = 16;

/// Error code used to refuse peer streams during a graceful close.
const CLOSING_STREAM_CODE: u64 = APP_NO_ERROR;

// ============================================================================
// States, ops, transmits
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no crypto byte seen yet.
    Fresh,
    /// First crypto byte seen, handshake in progress.
    Handshaking,
    /// Handshake completed.
    Established,
    /// Local close in progress; only CONNECTION_CLOSE may be sent.
    Closing,
    /// Peer closed; nothing may be sent.
    Draining,
    /// Closing period ended.
    Drained,
    /// Terminal.
    Destroyed,
}

/// Registry side-effects the owning socket applies after driving a session.
///
/// CID and reset-token associations change exclusively through transport
/// callbacks; the session queues them here rather than holding a socket
/// reference (the socket owns the session, never the reverse).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOp {
    AssociateCid(ConnectionId),
    DisassociateCid(ConnectionId),
    AssociateResetToken(StatelessResetToken),
    DisassociateResetToken(StatelessResetToken),
    /// Server intake demanded address validation; socket must send a Retry.
    SendRetry,
    /// The session is destroyed; drop it from the socket.
    Destroyed,
}

/// One serialized datagram plus the path it travels.
#[derive(Debug)]
pub struct Transmit {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub packet: QuicPacket,
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    side: Side,
    alpn: String,
    hostname: String,

    conn: Box<dyn TransportConnection>,
    crypto: CryptoContext,
    listener: Box<dyn SessionListener>,

    state: SessionState,
    silent_close: bool,
    stateless_reset: bool,
    graceful_closing: bool,
    in_transport_callback: bool,
    initialized: bool,

    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    max_pktlen: usize,

    scid: ConnectionId,
    /// Server only: the client's original DCID, routable to this session.
    rcid: Option<ConnectionId>,
    /// Preferred-address CID, when one was advertised.
    pscid: Option<ConnectionId>,

    last_error: QuicError,
    stats: SessionStats,
    streams: StreamMap,

    /// Serialized CONNECTION_CLOSE retained for closing-period resends.
    close_buf: Option<QuicPacket>,
    close_attempts: usize,
    close_limit: usize,

    idle: Timer,
    retransmit: Timer,

    transmits: VecDeque<Transmit>,
    ops: VecDeque<SessionOp>,

    preferred_address_policy: PreferredAddressPolicy,
}

impl Session {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Create a server session for an accepted Initial packet.
    #[allow(clippy::too_many_arguments)]
    pub fn new_server(
        conn: Box<dyn TransportConnection>,
        tls: Box<dyn TlsSession>,
        listener: Box<dyn SessionListener>,
        alpn: String,
        scid: ConnectionId,
        rcid: ConnectionId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        now: Instant,
    ) -> Self {
        let crypto = CryptoContext::new(tls, Side::Server, false);
        let mut session = Self::new_common(
            Side::Server,
            conn,
            crypto,
            listener,
            alpn,
            String::new(),
            scid,
            Some(rcid),
            local_addr,
            remote_addr,
            PreferredAddressPolicy::Ignore,
            now,
        );
        session.install_local_params();
        session.update_idle_timer(now);
        session
    }

    /// Create a client session. `start_handshake` must be called to emit
    /// the first flight.
    #[allow(clippy::too_many_arguments)]
    pub fn new_client(
        conn: Box<dyn TransportConnection>,
        tls: Box<dyn TlsSession>,
        listener: Box<dyn SessionListener>,
        config: &ClientConfig,
        scid: ConnectionId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        now: Instant,
    ) -> Self {
        let crypto = CryptoContext::new(tls, Side::Client, config.verify_hostname_identity);
        let mut session = Self::new_common(
            Side::Client,
            conn,
            crypto,
            listener,
            config.alpn.clone(),
            config.hostname.clone(),
            scid,
            None,
            local_addr,
            remote_addr,
            config.preferred_address_policy,
            now,
        );
        session.install_local_params();

        // 0-RTT resumption: replay remembered peer parameters and restore
        // the session ticket before the first flight.
        if let Some(ref blob) = config.early_transport_params {
            match TransportParams::decode(blob) {
                Some(params) => session.conn.set_early_remote_transport_params(&params),
                None => warn!("discarding malformed early transport parameters"),
            }
        }
        if let Some(ref ticket) = config.session_ticket {
            if !session.crypto.tls_mut().set_session_ticket(ticket) {
                warn!("session ticket rejected by TLS provider");
            }
        }

        session.update_idle_timer(now);
        session
    }

    #[allow(clippy::too_many_arguments)]
    fn new_common(
        side: Side,
        conn: Box<dyn TransportConnection>,
        crypto: CryptoContext,
        listener: Box<dyn SessionListener>,
        alpn: String,
        hostname: String,
        scid: ConnectionId,
        rcid: Option<ConnectionId>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        preferred_address_policy: PreferredAddressPolicy,
        now: Instant,
    ) -> Self {
        Self {
            side,
            alpn,
            hostname,
            conn,
            crypto,
            listener,
            state: SessionState::Fresh,
            silent_close: false,
            stateless_reset: false,
            graceful_closing: false,
            in_transport_callback: false,
            initialized: true,
            local_addr,
            remote_addr,
            max_pktlen: max_pktlen(&remote_addr),
            scid,
            rcid,
            pscid: None,
            last_error: QuicError::default(),
            stats: SessionStats::new(now),
            streams: StreamMap::new(),
            close_buf: None,
            close_attempts: 0,
            close_limit: 1,
            idle: Timer::new(),
            retransmit: Timer::new(),
            transmits: VecDeque::new(),
            ops: VecDeque::new(),
            preferred_address_policy,
        }
    }

    fn install_local_params(&mut self) {
        let blob = self.conn.local_transport_params().encode();
        self.crypto.tls_mut().set_local_transport_params(blob);
    }

    /// Client only: produce the first crypto flight and send it.
    pub fn start_handshake(&mut self, now: Instant) -> Result<(), SessionError> {
        debug_assert!(self.side.is_client());
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        self.crypto.receive(self.conn.as_mut(), CryptoLevel::Initial, &[])?;
        self.stats.handshake_send_at = Some(now);
        self.drain_keylog();
        self.send_pending(now);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_server(&self) -> bool {
        self.side.is_server()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == SessionState::Destroyed
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Drained)
    }

    pub fn is_gracefully_closing(&self) -> bool {
        self.graceful_closing
    }

    pub fn is_silent_close(&self) -> bool {
        self.silent_close
    }

    pub fn is_stateless_reset(&self) -> bool {
        self.stateless_reset
    }

    pub fn is_handshake_completed(&self) -> bool {
        matches!(
            self.state,
            SessionState::Established | SessionState::Closing | SessionState::Draining
        ) && self.stats.handshake_completed_at.is_some()
    }

    pub fn in_transport_callback(&self) -> bool {
        self.in_transport_callback
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn last_error(&self) -> QuicError {
        self.last_error
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn alpn(&self) -> &str {
        &self.alpn
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn scid(&self) -> &ConnectionId {
        &self.scid
    }

    /// The current destination CID, as tracked by the transport library.
    pub fn dcid(&self) -> ConnectionId {
        self.conn.dcid()
    }

    pub fn rcid(&self) -> Option<&ConnectionId> {
        self.rcid.as_ref()
    }

    pub fn pscid(&self) -> Option<&ConnectionId> {
        self.pscid.as_ref()
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    /// The peer address. Updated on every received packet; a session is not
    /// tied to a single remote address.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn max_packet_length(&self) -> usize {
        self.max_pktlen
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.streams.contains(id)
    }

    /// All source CIDs currently routed to this session, including the
    /// handshake-time identifiers held by the socket.
    pub fn source_cids(&self) -> Vec<ConnectionId> {
        let mut cids = self.conn.source_cids();
        if !cids.contains(&self.scid) {
            cids.push(self.scid.clone());
        }
        cids
    }

    pub fn active_reset_tokens(&self) -> Vec<StatelessResetToken> {
        self.conn.active_reset_tokens()
    }

    /// Peer transport parameters, encoded for storage alongside a session
    /// ticket (the `early_transport_params` input of a future session).
    pub fn remote_transport_params_blob(&self) -> Option<Bytes> {
        self.conn.remote_transport_params().map(|p| p.encode())
    }

    /// Drain datagrams queued for transmission.
    pub fn take_transmits(&mut self) -> Vec<Transmit> {
        self.transmits.drain(..).collect()
    }

    /// Drain pending registry side-effects for the socket.
    pub fn take_ops(&mut self) -> Vec<SessionOp> {
        self.ops.drain(..).collect()
    }

    /// Earliest pending timer deadline, if any.
    pub fn next_timeout(&self) -> Option<Instant> {
        match (self.idle.deadline(), self.retransmit.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Process one received datagram. Returns false if the packet was
    /// dropped or processing failed fatally.
    pub fn receive(
        &mut self,
        data: &[u8],
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        now: Instant,
    ) -> bool {
        if self.is_destroyed() {
            debug!("ignoring packet for destroyed session");
            return false;
        }

        self.stats.bytes_received += data.len() as u64;

        // In the closing period the only permissible reaction is one more
        // CONNECTION_CLOSE, rationed with exponential backoff so a chatty
        // peer cannot turn us into an amplifier.
        if self.conn.is_in_closing_period() {
            debug!("packet received while in closing period");
            self.increment_close_attempts();
            if !self.should_attempt_close() {
                return false;
            }
            return self.send_connection_close(now);
        }

        // Draining: the peer already closed. Discard silently.
        if self.conn.is_in_draining_period() {
            debug!("packet received while draining");
            return true;
        }

        // The peer may migrate between any two packets.
        self.remote_addr = remote_addr;
        self.local_addr = local_addr;
        let path = Path {
            local: local_addr,
            remote: remote_addr,
        };

        self.stats.received_at = Some(now);
        let mut events = Vec::new();
        self.in_transport_callback = true;
        let intake = self.conn.read_packet(&path, data, now, &mut events);
        let dispatch = events
            .into_iter()
            .try_for_each(|ev| self.dispatch_event(ev, now));
        self.in_transport_callback = false;
        self.update_data_stats();

        if let Err(err) = dispatch {
            debug!(?err, "transport callback failed");
            // A more specific error recorded during dispatch wins over the
            // generic callback-failure code.
            if self.last_error == QuicError::default() {
                self.set_last_error(QuicError::new(
                    ErrorFamily::Session,
                    TransportError::CallbackFailure.code() as u64,
                ));
            }
            self.handle_error(now);
            return false;
        }

        match intake {
            Ok(()) => {}
            Err(TransportError::Draining) | Err(TransportError::RecvVersionNegotiation) => {}
            Err(TransportError::RequiresRetry) if self.is_server() => {
                // Address validation first: hand the Retry to the socket,
                // then shut this embryonic session down.
                self.ops.push_back(SessionOp::SendRetry);
                self.set_last_error(QuicError::new(ErrorFamily::Session, NO_ERROR));
                self.immediate_close(now);
                return true;
            }
            Err(err) => {
                self.set_last_error(QuicError::new(ErrorFamily::Session, err.code() as u64));
                self.handle_error(now);
                return false;
            }
        }

        if self.is_destroyed() {
            return true;
        }

        // A dispatched event may have started an immediate close; emit the
        // deferred CONNECTION_CLOSE now that the callback scope is gone.
        if self.state == SessionState::Closing && !self.silent_close && self.close_buf.is_none() {
            self.send_connection_close(now);
            return true;
        }

        // Processing the packet may have put us into draining (peer sent
        // CONNECTION_CLOSE). Nothing left but a silent teardown.
        if self.conn.is_in_draining_period() {
            self.state = SessionState::Draining;
            self.silent_close(now);
            return true;
        }

        if self.state != SessionState::Closing {
            self.send_pending(now);
        }
        self.update_idle_timer(now);
        self.update_recovery_stats();
        true
    }

    fn dispatch_event(&mut self, event: ConnEvent, now: Instant) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Ok(());
        }
        match event {
            ConnEvent::ClientInitial => {
                self.crypto.receive(self.conn.as_mut(), CryptoLevel::Initial, &[])?;
            }
            ConnEvent::ReceiveClientInitial { dcid } => {
                self.note_handshake_byte(now);
                self.crypto.mark_handshake_started();
                self.conn
                    .install_initial_key(&dcid)
                    .map_err(|e| SessionError::Transport(e.code()))?;
            }
            ConnEvent::CryptoData { level, data, .. } => {
                self.note_handshake_byte(now);
                self.crypto.receive(self.conn.as_mut(), level, &data)?;
                self.drain_keylog();
                self.notify_handshake_pause();
            }
            ConnEvent::AckedCryptoOffset { level, datalen } => {
                self.crypto.acknowledge(level, datalen);
                self.stats.record_crypto_ack(now);
            }
            ConnEvent::HandshakeCompleted => self.handshake_completed(now)?,
            ConnEvent::HandshakeConfirmed => {
                self.stats.handshake_confirmed_at = Some(now);
                self.listener.on_handshake_confirmed();
            }
            ConnEvent::StreamData {
                stream_id,
                fin,
                offset,
                data,
            } => self.receive_stream_data(stream_id, fin, offset, data)?,
            ConnEvent::StreamOpen { stream_id } => {
                // No resources are committed until data arrives; that is the
                // stream-commitment defense. But during a graceful close new
                // peer streams are refused outright.
                if self.graceful_closing {
                    let _ = self.conn.shutdown_stream(stream_id, CLOSING_STREAM_CODE);
                }
                debug!(stream_id, "stream opened");
            }
            ConnEvent::StreamClose {
                stream_id,
                app_error_code,
            } => self.stream_close(stream_id, app_error_code, now),
            ConnEvent::StreamReset {
                stream_id,
                final_size,
                app_error_code,
            } => {
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.set_final_size(final_size);
                    self.listener
                        .on_stream_reset(stream_id, app_error_code, final_size);
                }
            }
            ConnEvent::AckedStreamDataOffset {
                stream_id, datalen, ..
            } => {
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.acknowledge(datalen);
                }
            }
            ConnEvent::NewConnectionId { cid, reset_token } => {
                self.ops.push_back(SessionOp::AssociateCid(cid));
                self.ops
                    .push_back(SessionOp::AssociateResetToken(reset_token));
            }
            ConnEvent::RemoveConnectionId { cid, reset_token } => {
                self.ops.push_back(SessionOp::DisassociateCid(cid));
                self.ops
                    .push_back(SessionOp::DisassociateResetToken(reset_token));
            }
            ConnEvent::PathValidation {
                result,
                local,
                remote,
            } => {
                match result {
                    PathValidationResult::Success => {
                        self.stats.path_validation_success_count += 1;
                    }
                    PathValidationResult::Failure => {
                        self.stats.path_validation_failure_count += 1;
                    }
                }
                self.listener.on_path_validation(result, local, remote);
            }
            ConnEvent::VersionNegotiation {
                requested,
                versions,
            } => {
                self.listener.on_version_negotiation(
                    requested,
                    &versions,
                    &[crate::types::VERSION_1],
                );
            }
            ConnEvent::StatelessReset => {
                self.stateless_reset = true;
            }
            ConnEvent::Retry => {
                debug!("retry received, restarting handshake");
                self.stats.retry_count += 1;
                let dcid = self.conn.dcid();
                self.conn
                    .install_initial_key(&dcid)
                    .map_err(|e| SessionError::Transport(e.code()))?;
            }
            ConnEvent::KeyUpdate { rx_secret, tx_secret } => {
                self.crypto.on_remote_key_update(rx_secret, tx_secret);
            }
            ConnEvent::SelectPreferredAddress { preferred } => {
                self.select_preferred_address(preferred);
            }
        }
        Ok(())
    }

    fn note_handshake_byte(&mut self, now: Instant) {
        if self.stats.handshake_start_at.is_none() {
            self.stats.handshake_start_at = Some(now);
            if self.state == SessionState::Fresh {
                self.state = SessionState::Handshaking;
            }
        }
        self.stats.handshake_continue_at = Some(now);
    }

    fn notify_handshake_pause(&mut self) {
        match self.crypto.pause() {
            HandshakePause::ClientHello => {
                let alpn = self.crypto.tls().alpn().unwrap_or_default();
                let servername = self.crypto.tls().servername().unwrap_or_default();
                let ciphers = self.crypto.tls().hello_ciphers();
                self.listener.on_client_hello(&alpn, &servername, &ciphers);
            }
            HandshakePause::Cert => {
                let servername = self.crypto.tls().servername().unwrap_or_default();
                self.listener.on_cert(&servername);
            }
            HandshakePause::None => {}
        }
    }

    fn drain_keylog(&mut self) {
        for line in self.crypto.take_keylog() {
            self.listener.on_keylog(&line);
        }
    }

    fn handshake_completed(&mut self, now: Instant) -> Result<(), SessionError> {
        debug!("handshake completed");
        self.stats.handshake_completed_at = Some(now);
        self.state = SessionState::Established;

        let verify = self.crypto.verify_peer_identity(&self.hostname);
        let (verify_error_reason, verify_error_code) = match &verify {
            Ok(()) => (None, 0),
            Err(e) => (Some(e.reason.clone()), e.code),
        };
        let info = HandshakeInfo {
            servername: self.crypto.tls().servername().unwrap_or_default(),
            alpn: self.crypto.tls().alpn().unwrap_or_default(),
            cipher: self.crypto.tls().cipher().unwrap_or_default(),
            cipher_version: self.crypto.tls().cipher_version().unwrap_or_default(),
            negotiated_version: self.conn.negotiated_version(),
            max_packet_length: self.max_pktlen,
            verify_error_reason,
            verify_error_code,
        };
        self.listener.on_handshake_completed(&info);

        if let Some(response) = self.crypto.tls_mut().take_ocsp_response() {
            self.listener.on_ocsp_response(response);
        }

        // A ticket plus the peer's transport parameters is everything a
        // future session needs for 0-RTT resumption.
        if let Some(ticket) = self.crypto.tls_mut().take_session_ticket() {
            let transport_params = self.remote_transport_params_blob().unwrap_or_default();
            self.listener.on_session_ticket(SessionTicket {
                ticket,
                transport_params,
            });
        }

        if verify.is_err() && self.side.is_client() {
            self.set_last_error(QuicError::crypto(0x2a));
            return Err(SessionError::CallbackFailure);
        }
        Ok(())
    }

    fn receive_stream_data(
        &mut self,
        stream_id: StreamId,
        fin: bool,
        offset: u64,
        data: Bytes,
    ) -> Result<(), SessionError> {
        // The connection-wide window always re-opens by the chunk length;
        // the stream window re-opens only when the host consumes.
        self.conn.extend_max_offset(data.len() as u64);

        // A zero-length chunk without fin commits nothing.
        if data.is_empty() && !fin {
            return Ok(());
        }
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }

        if !self.streams.contains(stream_id) {
            if self.graceful_closing {
                let _ = self.conn.shutdown_stream(stream_id, CLOSING_STREAM_CODE);
                return Ok(());
            }
            let writable = stream_direction(stream_id) == StreamDirection::Bidirectional;
            self.add_stream(Stream::new(stream_id, writable));
            self.listener.on_stream_ready(stream_id);
        }

        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.record_recv(offset, data.len());
        }
        self.listener.on_stream_data(stream_id, data, fin);
        Ok(())
    }

    fn add_stream(&mut self, stream: Stream) {
        debug_assert!(!self.graceful_closing);
        debug!(stream_id = stream.id(), "adding stream");
        match stream.origin() {
            StreamOrigin::Client => {
                if self.is_server() {
                    self.stats.streams_in_count += 1;
                } else {
                    self.stats.streams_out_count += 1;
                }
            }
            StreamOrigin::Server => {
                if self.is_server() {
                    self.stats.streams_out_count += 1;
                } else {
                    self.stats.streams_in_count += 1;
                }
            }
        }
        self.stats.streams_total += 1;
        match stream.direction() {
            StreamDirection::Bidirectional => self.stats.bidi_stream_count += 1,
            StreamDirection::Unidirectional => self.stats.uni_stream_count += 1,
        }
        self.streams.insert(stream);
    }

    fn stream_close(&mut self, stream_id: StreamId, app_error_code: u64, now: Instant) {
        if !self.streams.contains(stream_id) {
            return;
        }
        debug!(stream_id, app_error_code, "closing stream");
        self.remove_stream(stream_id);
        self.listener.on_stream_close(stream_id, app_error_code);

        // A graceful close completes once the last stream is gone.
        if self.graceful_closing && self.streams.is_empty() && !self.is_closing() {
            self.set_last_error(QuicError::new(ErrorFamily::Application, NO_ERROR));
            self.immediate_close(now);
        }
    }

    fn remove_stream(&mut self, stream_id: StreamId) {
        // The transport library only re-credits peer stream limits in
        // narrow cases; removal of a remote stream must extend manually.
        if !self.conn.is_local_stream(stream_id) {
            match stream_direction(stream_id) {
                StreamDirection::Bidirectional => self.conn.extend_max_streams_bidi(1),
                StreamDirection::Unidirectional => self.conn.extend_max_streams_uni(1),
            }
        }
        self.streams.remove(stream_id);
        // Discard transport-library state after the map entry is gone so
        // the close callback cannot loop back into a live stream.
        let _ = self.conn.shutdown_stream(stream_id, NO_ERROR);
    }

    fn select_preferred_address(&mut self, preferred: crate::config::PreferredAddress) {
        if self.preferred_address_policy != PreferredAddressPolicy::Accept {
            debug!("ignoring server preferred address");
            return;
        }
        let candidate: Option<SocketAddr> = match self.local_addr {
            SocketAddr::V4(_) => preferred
                .ipv4
                .map(|(ip, port)| SocketAddr::new(ip.into(), port)),
            SocketAddr::V6(_) => preferred
                .ipv6
                .map(|(ip, port)| SocketAddr::new(ip.into(), port)),
        };
        match candidate {
            Some(addr) => {
                debug!(%addr, "using server preferred address");
                self.pscid = Some(preferred.cid.clone());
                self.remote_addr = addr;
                self.listener.on_use_preferred_address(addr);
            }
            // Advertised families don't include ours.
            None => debug!("preferred address ignored, no matching family"),
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Serialize and queue pending stream and protocol data.
    ///
    /// No-op while inside a transport callback, destroyed, draining, or a
    /// closing server (only CONNECTION_CLOSE may flow then).
    pub fn send_pending(&mut self, now: Instant) {
        if self.in_transport_callback
            || self.is_destroyed()
            || self.conn.is_in_draining_period()
            || (self.is_server() && self.conn.is_in_closing_period())
        {
            return;
        }

        if !self.write_streams(now) {
            return;
        }
        self.write_protocol_packets(now);
        self.update_recovery_stats();
    }

    /// Drain each sendable stream into vectored writes. Returns false when
    /// serialization ended the session (silent close or fatal error).
    fn write_streams(&mut self, now: Instant) -> bool {
        let mut packets_sent = 0usize;
        for stream_id in self.streams.ids() {
            loop {
                let (chunks, fin): (Vec<&[u8]>, bool) = match self.streams.get(stream_id) {
                    Some(s) if s.wants_send() => (s.pending_chunks(), s.fin_for_next_write()),
                    _ => break,
                };
                let mut packet = QuicPacket::new("stream data", self.max_pktlen);
                let outcome = {
                    let chunks_ref: Vec<&[u8]> = chunks;
                    self.conn.writev_stream(
                        packet.data_mut(),
                        Some(stream_id),
                        &chunks_ref,
                        fin,
                        now,
                    )
                };
                match outcome {
                    Err(TransportError::PktNumExhausted) => {
                        // Nothing can be sent any more, not even a close.
                        self.silent_close(now);
                        return false;
                    }
                    Err(TransportError::StreamDataBlocked) => {
                        self.stats.block_count += 1;
                        self.listener.on_stream_blocked(stream_id);
                        if self.conn.max_data_left() == 0 {
                            return true; // congestion/flow limited
                        }
                        break; // next stream
                    }
                    Err(TransportError::StreamShutWr) | Err(TransportError::StreamNotFound) => {
                        break; // next stream
                    }
                    Err(err) => {
                        self.set_last_error(QuicError::new(
                            ErrorFamily::Session,
                            err.code() as u64,
                        ));
                        self.handle_error(now);
                        return false;
                    }
                    Ok(StreamWrite {
                        packet_len: 0,
                        consumed,
                    }) => {
                        if let (Some(n), Some(stream)) = (consumed, self.streams.get_mut(stream_id))
                        {
                            stream.commit(n);
                        }
                        return true; // congestion limited
                    }
                    Ok(StreamWrite {
                        packet_len,
                        consumed,
                    }) => {
                        let consumed = consumed.unwrap_or(0);
                        let mut fin_done = false;
                        if let Some(stream) = self.streams.get_mut(stream_id) {
                            stream.commit(consumed);
                            if fin && !stream.wants_send() {
                                stream.mark_fin_sent();
                                fin_done = true;
                            }
                        }
                        packet.set_len(packet_len);
                        self.send_packet(packet, now);
                        packets_sent += 1;
                        if packets_sent >= MAX_PACKETS_PER_SEND {
                            return true;
                        }
                        if fin_done {
                            break;
                        }
                    }
                }
            }
        }
        true
    }

    /// Let the transport library emit any remaining non-stream packets
    /// (acks, handshake frames, probes).
    fn write_protocol_packets(&mut self, now: Instant) {
        loop {
            let mut packet = QuicPacket::new("protocol data", self.max_pktlen);
            match self
                .conn
                .writev_stream(packet.data_mut(), None, &[], false, now)
            {
                Err(TransportError::PktNumExhausted) => {
                    self.silent_close(now);
                    return;
                }
                Err(err) => {
                    self.set_last_error(QuicError::new(ErrorFamily::Session, err.code() as u64));
                    self.handle_error(now);
                    return;
                }
                Ok(StreamWrite { packet_len: 0, .. }) => return,
                Ok(StreamWrite { packet_len, .. }) => {
                    packet.set_len(packet_len);
                    self.send_packet(packet, now);
                }
            }
        }
    }

    fn send_packet(&mut self, packet: QuicPacket, now: Instant) {
        debug_assert!(!self.is_destroyed());
        debug_assert!(!self.conn.is_in_draining_period());
        if packet.is_empty() {
            return;
        }
        self.stats.bytes_sent += packet.len() as u64;
        self.stats.sent_at = Some(now);
        self.schedule_retransmit(now);
        self.update_idle_timer(now);
        self.transmits.push_back(Transmit {
            local: self.local_addr,
            remote: self.remote_addr,
            packet,
        });
    }

    // ------------------------------------------------------------------
    // Streams (host-facing)
    // ------------------------------------------------------------------

    /// Open a locally initiated stream. Unidirectional streams have their
    /// read side shut immediately.
    pub fn open_stream(&mut self, direction: StreamDirection) -> Result<StreamId, SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        if self.is_closing() {
            return Err(SessionError::Closing);
        }
        if self.graceful_closing {
            return Err(SessionError::GracefulClosing);
        }
        let stream_id = match direction {
            StreamDirection::Bidirectional => self
                .conn
                .open_bidi_stream()
                .map_err(|e| SessionError::Transport(e.code()))?,
            StreamDirection::Unidirectional => {
                let id = self
                    .conn
                    .open_uni_stream()
                    .map_err(|e| SessionError::Transport(e.code()))?;
                self.conn
                    .shutdown_stream_read(id, 0)
                    .map_err(|e| SessionError::Transport(e.code()))?;
                id
            }
        };
        self.add_stream(Stream::new(stream_id, true));
        self.listener.on_stream_ready(stream_id);
        Ok(stream_id)
    }

    /// Queue outbound data on a stream; `fin` ends the write side.
    pub fn write_stream(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
        now: Instant,
    ) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(SessionError::UnknownStream(stream_id))?;
        if !data.is_empty() {
            stream.write(data);
        }
        if fin {
            stream.end();
        }
        if !self.in_transport_callback {
            self.send_pending(now);
        }
        Ok(())
    }

    /// Re-enter the send loop for a stream after the host produced data.
    pub fn resume_stream(&mut self, stream_id: StreamId, now: Instant) {
        if self.streams.contains(stream_id) && !self.in_transport_callback {
            self.send_pending(now);
        }
    }

    /// Schedule RESET_STREAM / STOP_SENDING for a stream.
    pub fn shutdown_stream(
        &mut self,
        stream_id: StreamId,
        code: u64,
        now: Instant,
    ) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        self.conn
            .shutdown_stream(stream_id, code)
            .map_err(|e| SessionError::Transport(e.code()))?;
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.shut_write(code);
        }
        if !self.in_transport_callback {
            self.send_pending(now);
        }
        Ok(())
    }

    /// Extend the stream-level flow-control window after the host consumed
    /// `amount` bytes.
    pub fn extend_stream_offset(&mut self, stream_id: StreamId, amount: u64) {
        if self.streams.contains(stream_id) {
            self.conn.extend_max_stream_offset(stream_id, amount);
        }
    }

    // ------------------------------------------------------------------
    // Close family
    // ------------------------------------------------------------------

    /// Immediate close: record the error, notify, serialize and retain a
    /// CONNECTION_CLOSE for the closing period.
    pub fn close(&mut self, code: u64, family: ErrorFamily, now: Instant) {
        if self.is_destroyed() || self.is_closing() {
            return;
        }
        self.set_last_error(QuicError::new(family, code));
        self.immediate_close(now);
    }

    /// Graceful close: no frames now; new streams are refused in both
    /// directions and the session closes with NO_ERROR once the last
    /// stream finishes naturally.
    pub fn graceful_close(&mut self, now: Instant) {
        if self.is_destroyed() || self.is_closing() || self.graceful_closing {
            return;
        }
        debug!("starting graceful close");
        self.graceful_closing = true;
        if self.streams.is_empty() {
            self.set_last_error(QuicError::new(ErrorFamily::Application, NO_ERROR));
            self.immediate_close(now);
        }
    }

    /// Enter the closing period. When invoked from inside callback
    /// dispatch, the CONNECTION_CLOSE serialization is deferred to the
    /// post-dispatch path in `receive`.
    fn immediate_close(&mut self, now: Instant) {
        // Closing may be entered exactly once.
        debug_assert!(!self.is_closing());
        self.state = SessionState::Closing;
        self.stats.closing_at = Some(now);
        let err = self.last_error;
        debug!(code = err.code, family = err.family.name(), "immediate close");
        self.listener.on_close(err);
        if !self.in_transport_callback {
            self.send_connection_close(now);
        }
    }

    /// Silent close: teardown without emitting a frame. Used for idle
    /// timeout, packet-number exhaustion, and received stateless resets.
    /// May also finish off a session that already entered the closing or
    /// draining period.
    pub fn silent_close(&mut self, now: Instant) {
        if self.is_destroyed() || self.silent_close {
            return;
        }
        self.silent_close = true;
        match self.state {
            SessionState::Closing | SessionState::Draining | SessionState::Drained => {}
            _ => {
                self.state = SessionState::Closing;
                self.stats.closing_at = Some(now);
            }
        }
        let err = self.last_error;
        debug!(
            code = err.code,
            family = err.family.name(),
            stateless_reset = self.stateless_reset,
            "silent close"
        );
        self.listener.on_silent_close(self.stateless_reset, err);
        self.destroy(now);
    }

    /// Serialize (or re-send) the CONNECTION_CLOSE. Returns false on
    /// failure. Never emits anything while draining or silently closing.
    pub fn send_connection_close(&mut self, now: Instant) -> bool {
        if self.in_transport_callback {
            return false;
        }
        if self.conn.is_in_draining_period() || self.silent_close {
            return true;
        }

        if self.close_buf.is_none() && !self.start_closing_period(now) {
            return false;
        }
        self.update_idle_timer(now);
        let packet = match &self.close_buf {
            Some(p) => p.clone(),
            None => return false,
        };
        self.send_packet(packet, now);
        true
    }

    /// Serialize the CONNECTION_CLOSE once, retaining it for resends.
    fn start_closing_period(&mut self, now: Instant) -> bool {
        if self.is_destroyed() {
            return false;
        }
        if self.conn.is_in_closing_period() && self.close_buf.is_some() {
            return true;
        }
        self.retransmit.stop();

        let error = self.last_error;
        debug!(code = error.code, "closing period started");
        let mut packet = QuicPacket::new("connection close", self.max_pktlen);
        match self
            .conn
            .write_connection_close(packet.data_mut(), error, now)
        {
            Ok(len) => {
                packet.set_len(len);
                self.close_buf = Some(packet);
                true
            }
            Err(TransportError::PktNumExhausted) => {
                self.set_last_error(QuicError::new(
                    ErrorFamily::Session,
                    TransportError::PktNumExhausted.code() as u64,
                ));
                self.silent_close(now);
                false
            }
            // The transport library cannot emit CONNECTION_CLOSE during the
            // handshake; record the error and tear down silently.
            Err(TransportError::InvalidState) => {
                self.set_last_error(QuicError::new(
                    ErrorFamily::Session,
                    TransportError::InvalidState.code() as u64,
                ));
                self.silent_close(now);
                false
            }
            Err(err) => {
                self.set_last_error(QuicError::new(ErrorFamily::Session, err.code() as u64));
                false
            }
        }
    }

    /// Terminal teardown. Idempotent. Makes one best-effort close attempt
    /// when no close has been communicated yet, then stops timers, drops
    /// streams and crypto buffers, and tells the socket to let go.
    pub fn destroy(&mut self, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        debug!("destroying session");

        if !self.in_transport_callback
            && !self.conn.is_in_closing_period()
            && !self.conn.is_in_draining_period()
            && !self.silent_close
            && !self.is_closing()
        {
            if self.last_error == QuicError::default() {
                self.set_last_error(QuicError::new(ErrorFamily::Session, NO_ERROR));
            }
            self.state = SessionState::Closing;
            self.stats.closing_at = Some(now);
            self.send_connection_close(now);
        }

        // Streams must all be gone before the session may die.
        for stream_id in self.streams.ids() {
            self.remove_stream(stream_id);
            self.listener.on_stream_close(stream_id, NO_ERROR);
        }
        debug_assert_eq!(self.stream_count(), 0);

        let leaked = self.crypto.cancel();
        if leaked > 0 {
            debug!(leaked, "handshake bytes never acknowledged");
        }

        self.idle.stop();
        self.retransmit.stop();
        self.graceful_closing = false;
        self.state = SessionState::Destroyed;
        self.ops.push_back(SessionOp::Destroyed);
        self.listener.on_destroyed();
    }

    fn handle_error(&mut self, now: Instant) {
        if self.is_destroyed() || (self.conn.is_in_closing_period() && !self.is_server()) {
            return;
        }
        if !self.is_closing() {
            self.state = SessionState::Closing;
            self.stats.closing_at = Some(now);
            self.listener.on_close(self.last_error);
        }
        if !self.send_connection_close(now) && !self.is_destroyed() {
            self.destroy(now);
        }
    }

    fn set_last_error(&mut self, error: QuicError) {
        self.last_error = error;
    }

    fn increment_close_attempts(&mut self) {
        self.close_attempts = self.close_attempts.saturating_add(1);
        self.stats.connection_close_attempts = self.close_attempts as u64;
    }

    /// Exponential backoff on close resends: fire only when the attempt
    /// counter reaches the limit, then double the limit.
    fn should_attempt_close(&mut self) -> bool {
        if self.close_attempts == self.close_limit {
            self.close_limit = self.close_limit.saturating_mul(2);
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // Probes, key update, timers
    // ------------------------------------------------------------------

    /// Emit a probe packet and refresh both timers. Fire-and-forget; a
    /// no-op inside callbacks or on a closing/destroyed session.
    pub fn ping(&mut self, now: Instant) {
        if self.in_transport_callback
            || self.is_destroyed()
            || self.is_closing()
            || self.conn.is_in_closing_period()
            || self.conn.is_in_draining_period()
        {
            return;
        }
        self.write_protocol_packets(now);
        self.update_idle_timer(now);
        self.schedule_retransmit(now);
    }

    /// Rotate the application traffic keys. Forbidden while an update is
    /// already in progress; flushes the handshake-completion packets when
    /// invoked outside a transport callback.
    pub fn update_key(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        self.crypto.initiate_key_update(self.conn.as_mut(), now)?;
        self.stats.keyupdate_count += 1;
        if !self.in_transport_callback {
            self.send_pending(now);
        }
        Ok(())
    }

    /// A stateless reset addressed to this session arrived at the socket
    /// (token match on a packet whose CID resolved to no session). The
    /// connection is defunct on the peer side; tear down silently.
    pub fn on_stateless_reset(&mut self, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        debug!("stateless reset received");
        self.stateless_reset = true;
        self.silent_close(now);
    }

    /// The idle timer fired: tear down silently. If the session was in the
    /// closing period, this is the end of that period.
    pub fn on_idle_timeout(&mut self, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        debug!("idle timeout");
        if self.state == SessionState::Closing {
            self.state = SessionState::Drained;
        }
        self.silent_close(now);
    }

    /// The retransmit timer fired: run loss detection or flush the delayed
    /// ack, then send whatever became pending.
    pub fn on_retransmit_timeout(&mut self, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        let mut transmit = false;
        if matches!(self.conn.loss_detection_expiry(), Some(e) if e <= now) {
            debug!("retransmitting on loss detection");
            if self.conn.on_loss_detection_timeout(now).is_err() {
                self.set_last_error(QuicError::new(
                    ErrorFamily::Session,
                    TransportError::CallbackFailure.code() as u64,
                ));
                self.handle_error(now);
                return;
            }
            self.stats.loss_retransmit_count += 1;
            transmit = true;
        } else if matches!(self.conn.ack_delay_expiry(), Some(e) if e <= now) {
            debug!("retransmitting on ack delay");
            self.conn.cancel_expired_ack_delay(now);
            self.stats.ack_delay_retransmit_count += 1;
            transmit = true;
        }
        if transmit {
            self.send_pending(now);
        }
    }

    /// Dispatch whichever timers have expired.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.retransmit.expired(now) {
            self.retransmit.stop();
            self.on_retransmit_timeout(now);
        }
        if self.idle.expired(now) {
            self.idle.stop();
            self.on_idle_timeout(now);
        }
    }

    fn update_idle_timer(&mut self, now: Instant) {
        if self.is_destroyed() {
            return;
        }
        self.idle.update_to(now, self.conn.idle_expiry());
    }

    fn schedule_retransmit(&mut self, now: Instant) {
        match self.conn.next_expiry() {
            Some(expiry) => self.retransmit.update_to(now, expiry),
            None => self.retransmit.stop(),
        }
    }

    fn update_data_stats(&mut self) {
        if self.is_destroyed() {
            return;
        }
        self.stats.note_bytes_in_flight(self.conn.bytes_in_flight());
    }

    fn update_recovery_stats(&mut self) {
        let rtt = self.conn.recovery_stats();
        self.stats.min_rtt_us = rtt.min_rtt_us;
        self.stats.latest_rtt_us = rtt.latest_rtt_us;
        self.stats.smoothed_rtt_us = rtt.smoothed_rtt_us;
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    /// Client only: migrate to a new local endpoint. The socket is
    /// responsible for moving CID and token registrations; this validates
    /// preconditions and tells the transport library to switch paths.
    pub fn migrate(
        &mut self,
        new_local: SocketAddr,
        now: Instant,
    ) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        if self.is_server() {
            return Err(SessionError::Transport(TransportError::InvalidState.code()));
        }
        if self.graceful_closing {
            return Err(SessionError::GracefulClosing);
        }
        let path = Path {
            local: new_local,
            remote: self.remote_addr,
        };
        self.conn
            .initiate_migration(&path, now)
            .map_err(|e| SessionError::Transport(e.code()))?;
        self.local_addr = new_local;
        if !self.in_transport_callback {
            self.send_pending(now);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Host callbacks resuming a paused handshake
    // ------------------------------------------------------------------

    /// The host finished handling the client-hello event.
    pub fn on_client_hello_done(&mut self, now: Instant) -> Result<(), SessionError> {
        self.resume_handshake(now)
    }

    /// The host finished handling the cert/OCSP event, optionally staging
    /// an OCSP response.
    pub fn on_cert_done(
        &mut self,
        ocsp_response: Option<Bytes>,
        now: Instant,
    ) -> Result<(), SessionError> {
        if let Some(response) = ocsp_response {
            self.crypto.tls_mut().set_ocsp_response(response);
        }
        self.resume_handshake(now)
    }

    fn resume_handshake(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Err(SessionError::Destroyed);
        }
        self.crypto.resume(self.conn.as_mut())?;
        self.drain_keylog();
        if !self.in_transport_callback {
            self.send_pending(now);
        }
        Ok(())
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("side", &self.side)
            .field("state", &self.state)
            .field("scid", &self.scid)
            .field("streams", &self.streams.len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
