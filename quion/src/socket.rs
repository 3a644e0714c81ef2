//! The QUIC socket: multiplexes UDP endpoints onto sessions.
//!
//! The socket owns every session (the only strong reference); the CID and
//! reset-token maps are lookup indices keyed back to a session's primary
//! SCID and never extend a session's lifetime. Inbound datagrams route by
//! CID; unroutable packets fall through to the admission path (server
//! Initial intake) or to stateless-reset handling.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use quion_quic::config::ClientConfig;
use quion_quic::crypto::TlsFactory;
use quion_quic::listener::SessionListener;
use quion_quic::CidGenerator;
use quion_quic::session::{Session, SessionOp};
use quion_quic::transport::{ClientSetup, Path, ServerSetup, TransportFactory};
use quion_quic::types::{
    ConnectionId, Side, StatelessResetToken, LOCAL_CID_LENGTH, MAX_VALIDATED_ADDRESS_LRU,
    MIN_INITIAL_PACKET_SIZE, STATELESS_RESET_TOKEN_LENGTH, VERSION_1,
};

use crate::config::SocketConfig;
use crate::endpoint::Endpoint;
use crate::packet::{parse_header, LongType, PacketHeader};
use crate::token::{
    generate_retry_token, reset_token_for_cid, validate_retry_token, SocketCidGenerator,
};

/// Smallest short-header packet we answer with a stateless reset; resets
/// for anything shorter risk reset loops.
const MIN_STATELESS_RESET_SOURCE: usize = 41;

// ============================================================================
// Listener and stats
// ============================================================================

/// Observer contract for the socket.
pub trait SocketListener {
    /// A session is being created; supply its event listener.
    fn make_session_listener(
        &mut self,
        scid: &ConnectionId,
        side: Side,
        remote: SocketAddr,
    ) -> Box<dyn SessionListener>;

    /// A server session finished admission and joined the socket.
    fn on_session_ready(&mut self, _scid: &ConnectionId) {}

    /// Server-busy mode was toggled.
    fn on_server_busy(&mut self, _busy: bool) {}

    /// An endpoint-level send error occurred.
    fn on_error(&mut self, _code: i64) {}
}

/// Per-socket counters.
#[derive(Debug, Clone)]
pub struct SocketStats {
    pub created_at: Instant,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_ignored: u64,
    pub packets_sent: u64,
    pub server_sessions: u64,
    pub client_sessions: u64,
    pub stateless_reset_count: u64,
    pub server_busy_count: u64,
}

impl SocketStats {
    fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            bytes_received: 0,
            bytes_sent: 0,
            packets_received: 0,
            packets_ignored: 0,
            packets_sent: 0,
            server_sessions: 0,
            client_sessions: 0,
            stateless_reset_count: 0,
            server_busy_count: 0,
        }
    }
}

/// One serialized datagram leaving the socket.
#[derive(Debug)]
pub struct OutboundPacket {
    pub data: Bytes,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

// ============================================================================
// The socket
// ============================================================================

pub struct QuicSocket {
    config: SocketConfig,
    transport: Arc<dyn TransportFactory>,
    tls: Arc<dyn TlsFactory>,
    cid_generator: Arc<SocketCidGenerator>,
    listener: Box<dyn SocketListener>,

    /// Strong ownership: primary SCID -> session.
    sessions: HashMap<ConnectionId, Session>,
    /// Weak index: any routable CID -> primary SCID.
    cid_index: HashMap<ConnectionId, ConnectionId>,
    /// Weak index: stateless reset token -> primary SCID.
    token_map: HashMap<StatelessResetToken, ConnectionId>,

    /// Live sessions per remote address.
    addr_counts: HashMap<SocketAddr, usize>,
    /// Stateless resets emitted per remote address.
    reset_counts: HashMap<SocketAddr, usize>,
    /// LRU of validated remote addresses (validate_address_lru).
    validated_addrs: VecDeque<SocketAddr>,

    listening: bool,
    busy: bool,
    graceful_close: bool,
    stateless_reset_disabled: bool,

    stats: SocketStats,
    outbound: VecDeque<OutboundPacket>,
}

impl QuicSocket {
    pub fn new(
        config: SocketConfig,
        transport: Arc<dyn TransportFactory>,
        tls: Arc<dyn TlsFactory>,
        listener: Box<dyn SocketListener>,
    ) -> Self {
        let config = config.clamped();
        let cid_generator = Arc::new(SocketCidGenerator::new(config.stateless_reset_secret));
        let stateless_reset_disabled = config.disable_stateless_reset;
        Self {
            config,
            transport,
            tls,
            cid_generator,
            listener,
            sessions: HashMap::new(),
            cid_index: HashMap::new(),
            token_map: HashMap::new(),
            addr_counts: HashMap::new(),
            reset_counts: HashMap::new(),
            validated_addrs: VecDeque::new(),
            listening: false,
            busy: false,
            graceful_close: false,
            stateless_reset_disabled,
            stats: SocketStats::new(Instant::now()),
            outbound: VecDeque::new(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle and flags
    // ------------------------------------------------------------------

    /// Start accepting server sessions.
    pub fn listen(&mut self) {
        self.listening = true;
    }

    /// Stop accepting new sessions; existing traffic continues.
    pub fn stop_listening(&mut self) {
        self.listening = false;
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Toggle server-busy mode: while set, new Initials are refused.
    pub fn set_server_busy(&mut self, busy: bool) {
        debug!(busy, "server busy mode");
        self.busy = busy;
        self.listener.on_server_busy(busy);
    }

    /// Enter graceful close: no new sessions; the socket is done once the
    /// existing ones finish.
    pub fn graceful_close(&mut self) {
        self.graceful_close = true;
        self.stop_listening();
    }

    pub fn is_done(&self) -> bool {
        self.graceful_close && self.sessions.is_empty()
    }

    /// Toggle stateless-reset emission; returns whether it is now enabled.
    pub fn toggle_stateless_reset(&mut self) -> bool {
        self.stateless_reset_disabled = !self.stateless_reset_disabled;
        !self.stateless_reset_disabled
    }

    pub fn stats(&self) -> &SocketStats {
        &self.stats
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Primary SCIDs of all live sessions.
    pub fn scids(&self) -> Vec<ConnectionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn session(&self, scid: &ConnectionId) -> Option<&Session> {
        self.sessions.get(scid)
    }

    /// Run `f` against a session, then apply whatever registry changes and
    /// transmits it produced.
    pub fn with_session<R>(
        &mut self,
        scid: &ConnectionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let result = {
            let session = self.sessions.get_mut(scid)?;
            f(session)
        };
        self.sync_session(scid.clone());
        Some(result)
    }

    /// Drain datagrams queued for transmission.
    pub fn take_outbound(&mut self) -> Vec<OutboundPacket> {
        self.outbound.drain(..).collect()
    }

    /// Earliest pending session timer.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.sessions.values().filter_map(Session::next_timeout).min()
    }

    /// Fire expired session timers.
    pub fn handle_timeouts(&mut self, now: Instant) {
        let scids: Vec<ConnectionId> = self.sessions.keys().cloned().collect();
        for scid in scids {
            if let Some(session) = self.sessions.get_mut(&scid) {
                session.on_timeout(now);
            }
            self.sync_session(scid);
        }
    }

    // ------------------------------------------------------------------
    // Client sessions
    // ------------------------------------------------------------------

    /// Create a client session toward `remote`. Returns its SCID handle.
    pub fn connect(
        &mut self,
        client_config: ClientConfig,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) -> Result<ConnectionId, quion_quic::SessionError> {
        let scid = self.cid_generator.generate_cid();
        let dcid = client_config
            .dcid
            .clone()
            .unwrap_or_else(ConnectionId::random);
        let path = Path { local, remote };
        let conn = self.transport.new_client(ClientSetup {
            dcid,
            scid: scid.clone(),
            version: VERSION_1,
            path,
            params: &client_config.params,
            cid_generator: self.cid_generator.clone(),
        });
        let tls = self.tls.new_session(
            Side::Client,
            Some(&client_config.hostname),
            &client_config.alpn,
            client_config.request_ocsp,
        );
        let listener = self
            .listener
            .make_session_listener(&scid, Side::Client, remote);
        let mut session = Session::new_client(
            conn,
            tls,
            listener,
            &client_config,
            scid.clone(),
            local,
            remote,
            now,
        );
        session.start_handshake(now)?;

        self.add_session(scid.clone(), session, remote);
        self.stats.client_sessions += 1;
        self.sync_session(scid.clone());
        Ok(scid)
    }

    /// Re-home a client session onto `target` (socket migration / NAT
    /// rebinding). Registrations move with it; the transport library is
    /// told to switch paths to the target endpoint's address.
    pub fn move_session(
        &mut self,
        scid: &ConnectionId,
        target: &mut QuicSocket,
        new_local: SocketAddr,
        now: Instant,
    ) -> Result<(), quion_quic::SessionError> {
        let mut session = self
            .sessions
            .remove(scid)
            .ok_or(quion_quic::SessionError::Destroyed)?;
        if let Err(err) = session.migrate(new_local, now) {
            // Preconditions failed (server side, graceful close); put the
            // session back untouched.
            self.sessions.insert(scid.clone(), session);
            return Err(err);
        }

        self.cid_index.retain(|_, owner| owner != scid);
        self.token_map.retain(|_, owner| owner != scid);
        let remote = session.remote_address();
        if let Some(count) = self.addr_counts.get_mut(&remote) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.addr_counts.remove(&remote);
                self.reset_counts.remove(&remote);
            }
        }

        target.add_session(scid.clone(), session, remote);
        target.sync_session(scid.clone());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Route one received datagram.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;

        let header = match parse_header(data, LOCAL_CID_LENGTH) {
            Some(h) => h,
            None => {
                self.stats.packets_ignored += 1;
                return;
            }
        };

        // Known CID: hand the packet to its session.
        if let Some(scid) = self.find_session(header.dcid()) {
            if let Some(session) = self.sessions.get_mut(&scid) {
                session.receive(data, local, remote, now);
            }
            self.sync_session(scid);
            return;
        }

        match header {
            PacketHeader::Short { .. } => {
                // No session for this CID. Either the trailing bytes are a
                // reset token we recognize, or the peer may deserve a
                // stateless reset from us.
                if self.maybe_stateless_reset(data, now) {
                    return;
                }
                self.maybe_send_stateless_reset(data, local, remote);
            }
            PacketHeader::Long {
                ty: LongType::Initial,
                version,
                dcid,
                scid,
                token,
            } => {
                if data.len() < MIN_INITIAL_PACKET_SIZE {
                    debug!(len = data.len(), "undersized initial ignored");
                    self.stats.packets_ignored += 1;
                    return;
                }
                if version != VERSION_1 {
                    self.send_version_negotiation(&dcid, &scid, local, remote);
                    return;
                }
                self.accept_initial(dcid, scid, &token, data, local, remote, now);
            }
            // Anything else without a session to route to is noise.
            _ => {
                self.stats.packets_ignored += 1;
            }
        }
    }

    fn find_session(&self, dcid: &ConnectionId) -> Option<ConnectionId> {
        if self.sessions.contains_key(dcid) {
            return Some(dcid.clone());
        }
        self.cid_index.get(dcid).cloned()
    }

    // ------------------------------------------------------------------
    // Server admission
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn accept_initial(
        &mut self,
        dcid: ConnectionId,
        client_scid: ConnectionId,
        token: &[u8],
        data: &[u8],
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) {
        if !self.listening || self.graceful_close {
            self.stats.packets_ignored += 1;
            return;
        }

        if self.busy {
            debug!(%remote, "refusing initial, server busy");
            self.stats.server_busy_count += 1;
            self.send_immediate_close(&client_scid, &dcid, local, remote, self.config.refuse_code);
            return;
        }

        if self.sessions.len() >= self.config.max_connections
            || self.addr_count(&remote) >= self.config.max_connections_per_host
        {
            debug!(%remote, "refusing initial, connection cap reached");
            self.send_immediate_close(&client_scid, &dcid, local, remote, self.config.refuse_code);
            return;
        }

        // Address validation: unvalidated peers get a Retry and must come
        // back with the token.
        let mut ocid = None;
        if self.config.validate_address && !self.is_validated_address(&remote) {
            if token.is_empty() {
                self.send_retry(&dcid, &client_scid, local, remote);
                return;
            }
            match validate_retry_token(&self.config.stateless_reset_secret, token, &remote) {
                Some(original) => {
                    self.set_validated_address(remote);
                    ocid = Some(original);
                }
                None => {
                    debug!(%remote, "invalid retry token, ignoring initial");
                    self.stats.packets_ignored += 1;
                    return;
                }
            }
        }

        let scid = self.cid_generator.generate_cid();
        let path = Path { local, remote };
        let conn = self.transport.new_server(ServerSetup {
            dcid: client_scid,
            scid: scid.clone(),
            ocid,
            version: VERSION_1,
            path,
            params: &self.config.transport_params,
            cid_generator: self.cid_generator.clone(),
        });
        let tls = self
            .tls
            .new_session(Side::Server, None, &self.config.alpn, false);
        let listener = self
            .listener
            .make_session_listener(&scid, Side::Server, remote);
        let mut session = Session::new_server(
            conn,
            tls,
            listener,
            self.config.alpn.clone(),
            scid.clone(),
            dcid.clone(),
            local,
            remote,
            now,
        );
        session.receive(data, local, remote, now);

        // The client's original DCID stays routable to this session until
        // the handshake settles on negotiated CIDs.
        self.add_session(scid.clone(), session, remote);
        self.cid_index.insert(dcid, scid.clone());
        self.stats.server_sessions += 1;
        self.listener.on_session_ready(&scid);
        self.sync_session(scid);
    }

    fn add_session(&mut self, scid: ConnectionId, session: Session, remote: SocketAddr) {
        *self.addr_counts.entry(remote).or_insert(0) += 1;
        for cid in session.source_cids() {
            self.cid_index.insert(cid, scid.clone());
        }
        for token in session.active_reset_tokens() {
            self.token_map.insert(token, scid.clone());
        }
        self.sessions.insert(scid, session);
    }

    fn remove_session(&mut self, scid: &ConnectionId) {
        let session = match self.sessions.remove(scid) {
            Some(s) => s,
            None => return,
        };
        self.cid_index.retain(|_, owner| owner != scid);
        self.token_map.retain(|_, owner| owner != scid);

        let remote = session.remote_address();
        if let Some(count) = self.addr_counts.get_mut(&remote) {
            *count -= 1;
            if *count == 0 {
                self.addr_counts.remove(&remote);
                self.reset_counts.remove(&remote);
            }
        }
        debug!(scid = %scid, "session removed from socket");
    }

    /// Apply a session's pending registry ops and queue its transmits.
    fn sync_session(&mut self, scid: ConnectionId) {
        let (ops, transmits) = match self.sessions.get_mut(&scid) {
            Some(session) => (session.take_ops(), session.take_transmits()),
            None => return,
        };

        for transmit in transmits {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += transmit.packet.len() as u64;
            self.outbound.push_back(OutboundPacket {
                data: transmit.packet.into_bytes(),
                local: transmit.local,
                remote: transmit.remote,
            });
        }

        let mut destroyed = false;
        for op in ops {
            match op {
                SessionOp::AssociateCid(cid) => {
                    // No two sessions may share a CID; the newest claim wins
                    // only if the CID is unclaimed.
                    self.cid_index.entry(cid).or_insert_with(|| scid.clone());
                }
                SessionOp::DisassociateCid(cid) => {
                    if self.cid_index.get(&cid) == Some(&scid) {
                        self.cid_index.remove(&cid);
                    }
                }
                SessionOp::AssociateResetToken(token) => {
                    self.token_map.insert(token, scid.clone());
                }
                SessionOp::DisassociateResetToken(token) => {
                    if self.token_map.get(&token) == Some(&scid) {
                        self.token_map.remove(&token);
                    }
                }
                SessionOp::SendRetry => {
                    if let Some(session) = self.sessions.get(&scid) {
                        let dcid = session.dcid();
                        let odcid = session
                            .rcid()
                            .cloned()
                            .unwrap_or_else(|| session.dcid());
                        let local = session.local_address();
                        let remote = session.remote_address();
                        self.send_retry(&odcid, &dcid, local, remote);
                    }
                }
                SessionOp::Destroyed => destroyed = true,
            }
        }

        if destroyed {
            self.remove_session(&scid);
        }
    }

    // ------------------------------------------------------------------
    // Stateless packets
    // ------------------------------------------------------------------

    fn maybe_stateless_reset(&mut self, data: &[u8], now: Instant) -> bool {
        if data.len() < STATELESS_RESET_TOKEN_LENGTH + 1 {
            return false;
        }
        let mut token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
        token.copy_from_slice(&data[data.len() - STATELESS_RESET_TOKEN_LENGTH..]);
        let scid = match self.token_map.get(&token) {
            Some(scid) => scid.clone(),
            None => return false,
        };
        debug!(scid = %scid, "inbound stateless reset");
        if let Some(session) = self.sessions.get_mut(&scid) {
            session.on_stateless_reset(now);
        }
        self.sync_session(scid);
        true
    }

    fn maybe_send_stateless_reset(
        &mut self,
        data: &[u8],
        local: SocketAddr,
        remote: SocketAddr,
    ) {
        if self.stateless_reset_disabled || data.len() < MIN_STATELESS_RESET_SOURCE {
            self.stats.packets_ignored += 1;
            return;
        }
        let count = self.reset_counts.entry(remote).or_insert(0);
        if *count >= self.config.max_stateless_resets_per_host {
            self.stats.packets_ignored += 1;
            return;
        }
        *count += 1;

        // Token derived from the unknown DCID: if the peer held state for
        // it, the token will match what we once advertised.
        let dcid = match parse_header(data, LOCAL_CID_LENGTH) {
            Some(PacketHeader::Short { dcid }) => dcid,
            _ => return,
        };
        let token = reset_token_for_cid(&self.config.stateless_reset_secret, &dcid);

        // A reset must be smaller than the packet that provoked it.
        let pad_to = data.len() - 1;
        let mut buf = vec![0u8; pad_to.max(STATELESS_RESET_TOKEN_LENGTH + 5)];
        match self.transport.write_stateless_reset(&mut buf, &token, pad_to) {
            Ok(len) => {
                buf.truncate(len);
                self.stats.stateless_reset_count += 1;
                self.queue_packet(buf, local, remote);
            }
            Err(err) => warn!(?err, "failed to serialize stateless reset"),
        }
    }

    fn send_version_negotiation(
        &mut self,
        dcid: &ConnectionId,
        scid: &ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
    ) {
        let mut buf = vec![0u8; 256];
        // Swapped CIDs: ours come from theirs.
        match self
            .transport
            .write_version_negotiation(&mut buf, scid, dcid, &[VERSION_1])
        {
            Ok(len) => {
                buf.truncate(len);
                self.queue_packet(buf, local, remote);
            }
            Err(err) => warn!(?err, "failed to serialize version negotiation"),
        }
    }

    fn send_retry(
        &mut self,
        odcid: &ConnectionId,
        client_scid: &ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
    ) {
        let token = generate_retry_token(
            &self.config.stateless_reset_secret,
            &remote,
            odcid,
            self.config.retry_token_timeout,
        );
        let new_scid = self.cid_generator.generate_cid();
        let mut buf = vec![0u8; 512];
        match self.transport.write_retry(
            &mut buf,
            VERSION_1,
            client_scid,
            &new_scid,
            odcid,
            &token,
        ) {
            Ok(len) => {
                buf.truncate(len);
                debug!(%remote, "sending retry");
                self.queue_packet(buf, local, remote);
            }
            Err(err) => warn!(?err, "failed to serialize retry"),
        }
    }

    fn send_immediate_close(
        &mut self,
        dcid: &ConnectionId,
        scid: &ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
        code: u64,
    ) {
        let mut buf = vec![0u8; 256];
        match self
            .transport
            .write_immediate_close(&mut buf, VERSION_1, dcid, scid, code)
        {
            Ok(len) => {
                buf.truncate(len);
                self.queue_packet(buf, local, remote);
            }
            Err(err) => warn!(?err, "failed to serialize immediate close"),
        }
    }

    fn queue_packet(&mut self, data: Vec<u8>, local: SocketAddr, remote: SocketAddr) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += data.len() as u64;
        self.outbound.push_back(OutboundPacket {
            data: Bytes::from(data),
            local,
            remote,
        });
    }

    // ------------------------------------------------------------------
    // Address validation bookkeeping
    // ------------------------------------------------------------------

    fn addr_count(&self, remote: &SocketAddr) -> usize {
        self.addr_counts.get(remote).copied().unwrap_or(0)
    }

    fn set_validated_address(&mut self, remote: SocketAddr) {
        if !self.config.validate_address_lru {
            return;
        }
        self.validated_addrs.push_back(remote);
        if self.validated_addrs.len() > MAX_VALIDATED_ADDRESS_LRU {
            self.validated_addrs.pop_front();
        }
    }

    fn is_validated_address(&self, remote: &SocketAddr) -> bool {
        self.config.validate_address_lru && self.validated_addrs.contains(remote)
    }

    // ------------------------------------------------------------------
    // Endpoint loop
    // ------------------------------------------------------------------

    /// Drive this socket on a single endpoint until `is_done`.
    ///
    /// Cooperative single-task loop: receive, dispatch, fire timers, flush.
    pub async fn run(&mut self, endpoint: &Endpoint) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 65535];
        loop {
            self.flush(endpoint).await?;
            if self.is_done() {
                return Ok(());
            }

            let timeout = self
                .next_timeout()
                .map(tokio::time::Instant::from_std);
            tokio::select! {
                received = endpoint.recv_from(&mut buf) => {
                    let (len, remote) = received?;
                    self.handle_datagram(&buf[..len], endpoint.local_addr(), remote, Instant::now());
                }
                _ = async {
                    match timeout {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        // No timer armed; wait for traffic.
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.handle_timeouts(Instant::now());
                }
            }
        }
    }

    /// Push queued datagrams out through the endpoint.
    pub async fn flush(&mut self, endpoint: &Endpoint) -> anyhow::Result<()> {
        for packet in self.take_outbound() {
            if let Err(err) = endpoint.send_to(&packet.data, packet.remote).await {
                self.listener
                    .on_error(err.raw_os_error().unwrap_or(-1) as i64);
            }
        }
        Ok(())
    }
}
