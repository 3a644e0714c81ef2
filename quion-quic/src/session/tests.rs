//! Session state-machine tests.
//!
//! Driven by a scriptable fake transport connection and TLS provider so
//! every lifecycle edge (closing backoff, draining, silent close, write
//! loop outcomes) can be exercised deterministically.

use super::*;
use crate::crypto::{HandshakeStatus, LevelSecrets, TlsSession, VerifyError};
use crate::transport::RecoveryStats;
use std::sync::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeConnState {
    on_read: VecDeque<Result<Vec<ConnEvent>, TransportError>>,
    write_script: VecDeque<Result<StreamWrite, TransportError>>,
    writes: Vec<(Option<StreamId>, usize, bool)>,
    submitted_crypto: Vec<(CryptoLevel, Bytes)>,
    shutdowns: Vec<(StreamId, u64)>,
    read_shutdowns: Vec<(StreamId, u64)>,
    close_writes: usize,
    close_error: Option<TransportError>,
    key_updates: usize,
    initial_key_installs: usize,
    closing: bool,
    draining: bool,
    max_data_left: u64,
    extended_offset: u64,
    extended_bidi: u64,
    extended_uni: u64,
    migrations: Vec<Path>,
    remote_params: Option<TransportParams>,
    early_params: Option<TransportParams>,
}

struct FakeConn {
    side: Side,
    dcid: ConnectionId,
    next_bidi: i64,
    next_uni: i64,
    idle_expiry: Instant,
    loss_expiry: Option<Instant>,
    ack_expiry: Option<Instant>,
    state: Arc<Mutex<FakeConnState>>,
}

impl FakeConn {
    fn new(side: Side) -> (Self, Arc<Mutex<FakeConnState>>) {
        let state = Arc::new(Mutex::new(FakeConnState {
            max_data_left: u64::MAX,
            ..Default::default()
        }));
        let conn = Self {
            side,
            dcid: ConnectionId::from_slice(&[9; 8]).unwrap(),
            next_bidi: if side.is_client() { 0 } else { 1 },
            next_uni: if side.is_client() { 2 } else { 3 },
            idle_expiry: Instant::now() + Duration::from_secs(10),
            loss_expiry: None,
            ack_expiry: None,
            state: state.clone(),
        };
        (conn, state)
    }
}

impl TransportConnection for FakeConn {
    fn read_packet(
        &mut self,
        _path: &Path,
        _data: &[u8],
        _now: Instant,
        events: &mut Vec<ConnEvent>,
    ) -> Result<(), TransportError> {
        let popped = self.state.lock().unwrap().on_read.pop_front();
        match popped {
            Some(Ok(evs)) => {
                events.extend(evs);
                Ok(())
            }
            Some(Err(e)) => {
                if e == TransportError::Draining {
                    self.state.lock().unwrap().draining = true;
                }
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn writev_stream(
        &mut self,
        _buf: &mut [u8],
        stream_id: Option<StreamId>,
        data: &[&[u8]],
        fin: bool,
        _now: Instant,
    ) -> Result<StreamWrite, TransportError> {
        let mut st = self.state.lock().unwrap();
        st.writes.push((
            stream_id,
            data.iter().map(|d| d.len()).sum(),
            fin,
        ));
        if let Some(scripted) = st.write_script.pop_front() {
            return scripted;
        }
        match stream_id {
            Some(_) => {
                let total: usize = data.iter().map(|d| d.len()).sum();
                if total == 0 && !fin {
                    return Ok(StreamWrite {
                        packet_len: 0,
                        consumed: None,
                    });
                }
                Ok(StreamWrite {
                    packet_len: total + 32,
                    consumed: Some(total),
                })
            }
            None => Ok(StreamWrite {
                packet_len: 0,
                consumed: None,
            }),
        }
    }

    fn write_connection_close(
        &mut self,
        _buf: &mut [u8],
        _error: QuicError,
        _now: Instant,
    ) -> Result<usize, TransportError> {
        let mut st = self.state.lock().unwrap();
        if let Some(err) = st.close_error {
            return Err(err);
        }
        st.close_writes += 1;
        st.closing = true;
        Ok(64)
    }

    fn submit_crypto_data(&mut self, level: CryptoLevel, data: Bytes) -> Result<(), TransportError> {
        self.state.lock().unwrap().submitted_crypto.push((level, data));
        Ok(())
    }

    fn install_secrets(
        &mut self,
        _level: CryptoLevel,
        _rx: Bytes,
        _tx: Bytes,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn initiate_key_update(
        &mut self,
        _rx: Bytes,
        _tx: Bytes,
        _now: Instant,
    ) -> Result<(), TransportError> {
        self.state.lock().unwrap().key_updates += 1;
        Ok(())
    }

    fn install_initial_key(&mut self, _dcid: &ConnectionId) -> Result<(), TransportError> {
        self.state.lock().unwrap().initial_key_installs += 1;
        Ok(())
    }

    fn shutdown_stream(&mut self, stream_id: StreamId, code: u64) -> Result<(), TransportError> {
        self.state.lock().unwrap().shutdowns.push((stream_id, code));
        Ok(())
    }

    fn shutdown_stream_read(&mut self, stream_id: StreamId, code: u64) -> Result<(), TransportError> {
        self.state.lock().unwrap().read_shutdowns.push((stream_id, code));
        Ok(())
    }

    fn open_bidi_stream(&mut self) -> Result<StreamId, TransportError> {
        let id = self.next_bidi;
        self.next_bidi += 4;
        Ok(id)
    }

    fn open_uni_stream(&mut self) -> Result<StreamId, TransportError> {
        let id = self.next_uni;
        self.next_uni += 4;
        Ok(id)
    }

    fn is_local_stream(&self, stream_id: StreamId) -> bool {
        crate::types::is_local_stream(self.side, stream_id)
    }

    fn extend_max_offset(&mut self, amount: u64) {
        self.state.lock().unwrap().extended_offset += amount;
    }

    fn extend_max_stream_offset(&mut self, _stream_id: StreamId, _amount: u64) {}

    fn extend_max_streams_bidi(&mut self, n: u64) {
        self.state.lock().unwrap().extended_bidi += n;
    }

    fn extend_max_streams_uni(&mut self, n: u64) {
        self.state.lock().unwrap().extended_uni += n;
    }

    fn is_in_closing_period(&self) -> bool {
        self.state.lock().unwrap().closing
    }

    fn is_in_draining_period(&self) -> bool {
        self.state.lock().unwrap().draining
    }

    fn idle_expiry(&self) -> Instant {
        self.idle_expiry
    }

    fn loss_detection_expiry(&self) -> Option<Instant> {
        self.loss_expiry
    }

    fn ack_delay_expiry(&self) -> Option<Instant> {
        self.ack_expiry
    }

    fn next_expiry(&self) -> Option<Instant> {
        match (self.loss_expiry, self.ack_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_loss_detection_timeout(&mut self, _now: Instant) -> Result<(), TransportError> {
        self.loss_expiry = None;
        Ok(())
    }

    fn cancel_expired_ack_delay(&mut self, _now: Instant) {
        self.ack_expiry = None;
    }

    fn source_cids(&self) -> Vec<ConnectionId> {
        Vec::new()
    }

    fn dcid(&self) -> ConnectionId {
        self.dcid.clone()
    }

    fn active_reset_tokens(&self) -> Vec<StatelessResetToken> {
        Vec::new()
    }

    fn local_transport_params(&self) -> TransportParams {
        TransportParams::default()
    }

    fn remote_transport_params(&self) -> Option<TransportParams> {
        let st = self.state.lock().unwrap();
        st.remote_params.clone().or_else(|| st.early_params.clone())
    }

    fn set_early_remote_transport_params(&mut self, params: &TransportParams) {
        self.state.lock().unwrap().early_params = Some(params.clone());
    }

    fn negotiated_version(&self) -> u32 {
        crate::types::VERSION_1
    }

    fn max_data_left(&self) -> u64 {
        self.state.lock().unwrap().max_data_left
    }

    fn bytes_in_flight(&self) -> u64 {
        0
    }

    fn recovery_stats(&self) -> RecoveryStats {
        RecoveryStats::default()
    }

    fn initiate_migration(&mut self, path: &Path, _now: Instant) -> Result<(), TransportError> {
        self.state.lock().unwrap().migrations.push(*path);
        Ok(())
    }
}

#[derive(Default)]
struct FakeTls {
    outbound: Vec<(CryptoLevel, Bytes)>,
    secrets: Vec<LevelSecrets>,
    ticket: Option<Bytes>,
    complete: bool,
    restored_ticket: Option<Vec<u8>>,
    verify_fails: bool,
}

impl TlsSession for FakeTls {
    fn read_handshake(&mut self, _level: CryptoLevel, _data: &[u8]) -> Result<HandshakeStatus, u8> {
        Ok(HandshakeStatus::Ok)
    }
    fn take_outbound(&mut self) -> Vec<(CryptoLevel, Bytes)> {
        std::mem::take(&mut self.outbound)
    }
    fn take_secrets(&mut self) -> Vec<LevelSecrets> {
        std::mem::take(&mut self.secrets)
    }
    fn take_keylog(&mut self) -> Vec<String> {
        Vec::new()
    }
    fn is_handshake_complete(&self) -> bool {
        self.complete
    }
    fn alpn(&self) -> Option<String> {
        Some("h3".into())
    }
    fn cipher(&self) -> Option<String> {
        Some("TLS_AES_128_GCM_SHA256".into())
    }
    fn cipher_version(&self) -> Option<String> {
        Some("TLSv1.3".into())
    }
    fn servername(&self) -> Option<String> {
        Some("example.org".into())
    }
    fn hello_ciphers(&self) -> Vec<String> {
        Vec::new()
    }
    fn verify_peer(&self, _hostname: &str, _verify: bool) -> Result<(), VerifyError> {
        if self.verify_fails {
            Err(VerifyError {
                reason: "self signed certificate".into(),
                code: 18,
            })
        } else {
            Ok(())
        }
    }
    fn update_traffic_secrets(&mut self, rx: &[u8], tx: &[u8]) -> (Bytes, Bytes) {
        (Bytes::copy_from_slice(rx), Bytes::copy_from_slice(tx))
    }
    fn peer_transport_params(&self) -> Option<Bytes> {
        None
    }
    fn set_local_transport_params(&mut self, _blob: Bytes) {}
    fn take_session_ticket(&mut self) -> Option<Bytes> {
        self.ticket.take()
    }
    fn set_session_ticket(&mut self, ticket: &[u8]) -> bool {
        self.restored_ticket = Some(ticket.to_vec());
        true
    }
    fn set_ocsp_response(&mut self, _response: Bytes) {}
    fn take_ocsp_response(&mut self) -> Option<Bytes> {
        None
    }
    fn early_data(&self) -> bool {
        self.restored_ticket.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    HandshakeCompleted(String),
    Close(QuicError),
    SilentClose { stateless_reset: bool, error: QuicError },
    Destroyed,
    StreamReady(StreamId),
    StreamData(StreamId, usize, bool),
    StreamClose(StreamId, u64),
    StreamReset(StreamId, u64, u64),
    StreamBlocked(StreamId),
    Ticket(usize),
    VersionNegotiation(u32, Vec<u32>),
    PathValidation(PathValidationResult),
    UsePreferredAddress(SocketAddr),
}

#[derive(Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl SessionListener for Recorder {
    fn on_handshake_completed(&mut self, info: &HandshakeInfo) {
        self.seen
            .lock().unwrap()
            .push(Seen::HandshakeCompleted(info.alpn.clone()));
    }
    fn on_close(&mut self, error: QuicError) {
        self.seen.lock().unwrap().push(Seen::Close(error));
    }
    fn on_silent_close(&mut self, stateless_reset: bool, error: QuicError) {
        self.seen.lock().unwrap().push(Seen::SilentClose {
            stateless_reset,
            error,
        });
    }
    fn on_destroyed(&mut self) {
        self.seen.lock().unwrap().push(Seen::Destroyed);
    }
    fn on_stream_ready(&mut self, stream_id: StreamId) {
        self.seen.lock().unwrap().push(Seen::StreamReady(stream_id));
    }
    fn on_stream_data(&mut self, stream_id: StreamId, data: Bytes, fin: bool) {
        self.seen
            .lock().unwrap()
            .push(Seen::StreamData(stream_id, data.len(), fin));
    }
    fn on_stream_close(&mut self, stream_id: StreamId, code: u64) {
        self.seen.lock().unwrap().push(Seen::StreamClose(stream_id, code));
    }
    fn on_stream_reset(&mut self, stream_id: StreamId, code: u64, final_size: u64) {
        self.seen
            .lock().unwrap()
            .push(Seen::StreamReset(stream_id, code, final_size));
    }
    fn on_stream_blocked(&mut self, stream_id: StreamId) {
        self.seen.lock().unwrap().push(Seen::StreamBlocked(stream_id));
    }
    fn on_session_ticket(&mut self, ticket: SessionTicket) {
        self.seen
            .lock().unwrap()
            .push(Seen::Ticket(ticket.transport_params.len()));
    }
    fn on_version_negotiation(&mut self, requested: u32, peer: &[u32], _local: &[u32]) {
        self.seen
            .lock().unwrap()
            .push(Seen::VersionNegotiation(requested, peer.to_vec()));
    }
    fn on_path_validation(&mut self, result: PathValidationResult, _l: SocketAddr, _r: SocketAddr) {
        self.seen.lock().unwrap().push(Seen::PathValidation(result));
    }
    fn on_use_preferred_address(&mut self, remote: SocketAddr) {
        self.seen.lock().unwrap().push(Seen::UsePreferredAddress(remote));
    }
}

// ============================================================================
// Harness
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

struct Harness {
    session: Session,
    conn: Arc<Mutex<FakeConnState>>,
    seen: Arc<Mutex<Vec<Seen>>>,
    now: Instant,
    local: SocketAddr,
    remote: SocketAddr,
}

impl Harness {
    fn client() -> Self {
        Self::client_with(FakeTls::default(), ClientConfig::default())
    }

    fn client_with(tls: FakeTls, config: ClientConfig) -> Self {
        init_tracing();
        let (conn, conn_state) = FakeConn::new(Side::Client);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = Recorder { seen: seen.clone() };
        let now = Instant::now();
        let local: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let session = Session::new_client(
            Box::new(conn),
            Box::new(tls),
            Box::new(listener),
            &config,
            ConnectionId::random(),
            local,
            remote,
            now,
        );
        Self {
            session,
            conn: conn_state,
            seen,
            now,
            local,
            remote,
        }
    }

    fn server() -> Self {
        init_tracing();
        let (conn, conn_state) = FakeConn::new(Side::Server);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = Recorder { seen: seen.clone() };
        let now = Instant::now();
        let local: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let session = Session::new_server(
            Box::new(conn),
            Box::new(FakeTls::default()),
            Box::new(listener),
            "h3".into(),
            ConnectionId::random(),
            ConnectionId::from_slice(&[7; 8]).unwrap(),
            local,
            remote,
            now,
        );
        Self {
            session,
            conn: conn_state,
            seen,
            now,
            local,
            remote,
        }
    }

    fn push_events(&self, events: Vec<ConnEvent>) {
        self.conn.lock().unwrap().on_read.push_back(Ok(events));
    }

    fn receive(&mut self) -> bool {
        self.now += Duration::from_millis(1);
        self.session
            .receive(&[0u8; 64], self.local, self.remote, self.now)
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

// ============================================================================
// Receive contracts
// ============================================================================

#[test]
fn test_receive_on_destroyed_session_drops() {
    let mut h = Harness::client();
    h.session.destroy(h.now);
    assert!(!h.receive());
}

#[test]
fn test_draining_drops_silently() {
    let mut h = Harness::client();
    h.conn.lock().unwrap().draining = true;
    assert!(h.receive());
    assert!(h.session.take_transmits().is_empty());
}

#[test]
fn test_closing_period_resend_backoff() {
    let mut h = Harness::client();
    h.session.close(0, ErrorFamily::Application, h.now);
    assert!(h.session.is_closing());
    assert_eq!(h.session.take_transmits().len(), 1);

    // Resend fires when the attempt counter hits the doubling limit:
    // attempts 1, 2, 4, 8 ... out of inbound packets.
    let mut resends = 0;
    for _ in 0..10 {
        if h.receive() {
            resends += 1;
        }
    }
    assert_eq!(resends, 4); // at attempts 1, 2, 4, 8
    assert_eq!(h.session.take_transmits().len(), 4);
    assert_eq!(h.session.stats().connection_close_attempts, 10);
}

#[test]
fn test_remote_address_updates_per_packet() {
    let mut h = Harness::client();
    h.remote = "127.0.0.1:9999".parse().unwrap();
    assert!(h.receive());
    assert_eq!(h.session.remote_address(), h.remote);
}

#[test]
fn test_peer_close_enters_draining_then_silent_close() {
    let mut h = Harness::client();
    h.conn.lock().unwrap().on_read.push_back(Err(TransportError::Draining));
    assert!(h.receive());
    assert!(h.session.is_destroyed());
    let seen = h.seen();
    assert!(seen.iter().any(|s| matches!(
        s,
        Seen::SilentClose {
            stateless_reset: false,
            ..
        }
    )));
}

#[test]
fn test_stateless_reset_flag_travels_with_silent_close() {
    let mut h = Harness::client();
    h.push_events(vec![ConnEvent::StatelessReset]);
    h.conn.lock().unwrap().draining = true;
    assert!(h.receive());
    assert!(h.session.is_stateless_reset());
    assert!(h.seen().iter().any(|s| matches!(
        s,
        Seen::SilentClose {
            stateless_reset: true,
            ..
        }
    )));
}

#[test]
fn test_fatal_intake_error_records_and_closes() {
    let mut h = Harness::client();
    h.conn
        .lock().unwrap()
        .on_read
        .push_back(Err(TransportError::Other(-100)));
    assert!(!h.receive());
    assert_eq!(h.session.last_error().family, ErrorFamily::Session);
    assert!(h.session.is_closing() || h.session.is_destroyed());
}

#[test]
fn test_server_retry_demand_sends_retry_op() {
    let mut h = Harness::server();
    h.conn
        .lock().unwrap()
        .on_read
        .push_back(Err(TransportError::RequiresRetry));
    assert!(h.receive());
    assert!(h.session.take_ops().contains(&SessionOp::SendRetry));
    assert!(h.session.is_closing());
}

// ============================================================================
// Handshake
// ============================================================================

#[test]
fn test_handshake_completion_snapshots_and_tickets() {
    let tls = FakeTls {
        ticket: Some(Bytes::from_static(b"ticket")),
        complete: true,
        ..Default::default()
    };
    let mut h = Harness::client_with(tls, ClientConfig::default());
    h.conn.lock().unwrap().remote_params = Some(TransportParams::default());
    h.push_events(vec![
        ConnEvent::CryptoData {
            level: CryptoLevel::Initial,
            offset: 0,
            data: Bytes::from_static(b"sh"),
        },
        ConnEvent::HandshakeCompleted,
    ]);
    assert!(h.receive());
    assert_eq!(h.session.state(), SessionState::Established);
    assert!(h.session.is_handshake_completed());

    let seen = h.seen();
    assert!(seen.contains(&Seen::HandshakeCompleted("h3".into())));
    // Ticket carries the peer's transport parameters for resumption.
    let blob_len = TransportParams::default().encode().len();
    assert!(seen.contains(&Seen::Ticket(blob_len)));

    // Timestamps are non-decreasing.
    let stats = h.session.stats();
    let start = stats.handshake_start_at.unwrap();
    assert!(stats.created_at <= start);
    assert!(start <= stats.handshake_completed_at.unwrap());
}

#[test]
fn test_client_verify_failure_is_fatal() {
    let tls = FakeTls {
        verify_fails: true,
        ..Default::default()
    };
    let mut h = Harness::client_with(tls, ClientConfig::default());
    h.push_events(vec![ConnEvent::HandshakeCompleted]);
    assert!(!h.receive());
    // The recorded crypto error survives the generic callback failure.
    assert_eq!(h.session.last_error().family, ErrorFamily::Crypto);
}

#[test]
fn test_crypto_acks_feed_latency_histogram() {
    let mut h = Harness::client();
    for _ in 0..3 {
        h.push_events(vec![ConnEvent::AckedCryptoOffset {
            level: CryptoLevel::Initial,
            datalen: 10,
        }]);
        assert!(h.receive());
    }
    let stats = h.session.stats();
    assert!(stats.handshake_acked_at.is_some());
    assert_eq!(stats.crypto_ack_latency.count(), 2);
}

#[test]
fn test_client_retry_reinstalls_initial_keys() {
    let mut h = Harness::client();
    h.push_events(vec![ConnEvent::Retry]);
    assert!(h.receive());
    assert_eq!(h.session.stats().retry_count, 1);
    assert_eq!(h.conn.lock().unwrap().initial_key_installs, 1);
}

#[test]
fn test_early_transport_params_replayed() {
    let params = TransportParams {
        max_data: 42_000,
        ..TransportParams::default()
    };
    let config = ClientConfig {
        early_transport_params: Some(params.encode()),
        session_ticket: Some(Bytes::from_static(b"stored-ticket")),
        ..ClientConfig::default()
    };
    let h = Harness::client_with(FakeTls::default(), config);
    let replayed = h.conn.lock().unwrap().early_params.clone().unwrap();
    assert_eq!(replayed.max_data, 42_000);
    // Round trip: effective limits equal the exported ones.
    assert_eq!(
        h.session.remote_transport_params_blob().unwrap(),
        params.encode()
    );
}

// ============================================================================
// Streams
// ============================================================================

#[test]
fn test_zero_length_non_fin_creates_no_stream() {
    let mut h = Harness::server();
    h.push_events(vec![ConnEvent::StreamData {
        stream_id: 0,
        fin: false,
        offset: 0,
        data: Bytes::new(),
    }]);
    assert!(h.receive());
    assert_eq!(h.session.stream_count(), 0);
    assert!(h.seen().is_empty());
}

#[test]
fn test_stream_data_creates_stream_and_extends_offset() {
    let mut h = Harness::server();
    h.push_events(vec![ConnEvent::StreamData {
        stream_id: 0,
        fin: false,
        offset: 0,
        data: Bytes::from_static(b"hello"),
    }]);
    assert!(h.receive());
    assert_eq!(h.session.stream_count(), 1);
    // Connection-wide window re-opens by the chunk length every time.
    assert_eq!(h.conn.lock().unwrap().extended_offset, 5);
    let seen = h.seen();
    assert_eq!(seen[0], Seen::StreamReady(0));
    assert_eq!(seen[1], Seen::StreamData(0, 5, false));
    // Origin-based counting plus the dedicated total.
    assert_eq!(h.session.stats().streams_in_count, 1);
    assert_eq!(h.session.stats().streams_out_count, 0);
    assert_eq!(h.session.stats().streams_total, 1);
}

#[test]
fn test_open_uni_stream_shuts_read_side() {
    let mut h = Harness::client();
    let id = h.session.open_stream(StreamDirection::Unidirectional).unwrap();
    assert_eq!(id, 2);
    assert_eq!(h.conn.lock().unwrap().read_shutdowns, vec![(2, 0)]);
    assert_eq!(h.session.stats().uni_stream_count, 1);
    assert_eq!(h.session.stats().streams_out_count, 1);
}

#[test]
fn test_write_loop_serializes_and_latches_fin() {
    let mut h = Harness::client();
    let id = h.session.open_stream(StreamDirection::Bidirectional).unwrap();
    let payload = Bytes::from(vec![0xaa; 10 * 1024]);
    h.session.write_stream(id, payload, true, h.now).unwrap();

    let transmits = h.session.take_transmits();
    assert!(!transmits.is_empty());
    let sent: u64 = transmits.iter().map(|t| t.packet.len() as u64).sum();
    assert_eq!(h.session.stats().bytes_sent, sent);

    // All bytes committed, fin serialized exactly once.
    let st = h.conn.lock().unwrap();
    let stream_writes: Vec<_> = st.writes.iter().filter(|w| w.0 == Some(id)).collect();
    assert!(stream_writes.iter().any(|w| w.2));
    let total: usize = stream_writes.iter().map(|w| w.1).sum();
    assert_eq!(total, 10 * 1024);
}

#[test]
fn test_stream_ack_frees_outbound_bytes() {
    let mut h = Harness::client();
    let id = h.session.open_stream(StreamDirection::Bidirectional).unwrap();
    h.session
        .write_stream(id, Bytes::from_static(b"0123456789"), false, h.now)
        .unwrap();
    h.push_events(vec![ConnEvent::AckedStreamDataOffset {
        stream_id: id,
        offset: 0,
        datalen: 10,
    }]);
    assert!(h.receive());
}

#[test]
fn test_congestion_limited_stops_loop() {
    let mut h = Harness::client();
    let id = h.session.open_stream(StreamDirection::Bidirectional).unwrap();
    h.conn.lock().unwrap().write_script.push_back(Ok(StreamWrite {
        packet_len: 0,
        consumed: None,
    }));
    h.session
        .write_stream(id, Bytes::from_static(b"data"), false, h.now)
        .unwrap();
    assert!(h.session.take_transmits().is_empty());
}

#[test]
fn test_pkt_num_exhausted_silent_closes() {
    let mut h = Harness::client();
    let id = h.session.open_stream(StreamDirection::Bidirectional).unwrap();
    h.conn
        .lock().unwrap()
        .write_script
        .push_back(Err(TransportError::PktNumExhausted));
    h.session
        .write_stream(id, Bytes::from_static(b"data"), false, h.now)
        .unwrap();
    assert!(h.session.is_destroyed());
    assert!(h
        .seen()
        .iter()
        .any(|s| matches!(s, Seen::SilentClose { .. })));
    // While silently closing, not a single frame goes out.
    assert!(h.session.take_transmits().is_empty());
}

#[test]
fn test_stream_blocked_reports_and_skips() {
    let mut h = Harness::client();
    let id = h.session.open_stream(StreamDirection::Bidirectional).unwrap();
    h.conn
        .lock().unwrap()
        .write_script
        .push_back(Err(TransportError::StreamDataBlocked));
    h.session
        .write_stream(id, Bytes::from_static(b"data"), false, h.now)
        .unwrap();
    assert_eq!(h.session.stats().block_count, 1);
    assert!(h.seen().contains(&Seen::StreamBlocked(id)));
    assert!(!h.session.is_destroyed());
}

#[test]
fn test_peer_stream_reset_delivers_final_size() {
    let mut h = Harness::server();
    h.push_events(vec![ConnEvent::StreamData {
        stream_id: 0,
        fin: false,
        offset: 0,
        data: Bytes::from_static(b"x"),
    }]);
    assert!(h.receive());
    h.push_events(vec![ConnEvent::StreamReset {
        stream_id: 0,
        final_size: 77,
        app_error_code: 9,
    }]);
    assert!(h.receive());
    assert!(h.seen().contains(&Seen::StreamReset(0, 9, 77)));
}

#[test]
fn test_remote_stream_removal_extends_limits() {
    let mut h = Harness::server();
    h.push_events(vec![ConnEvent::StreamData {
        stream_id: 0,
        fin: true,
        offset: 0,
        data: Bytes::from_static(b"x"),
    }]);
    assert!(h.receive());
    h.push_events(vec![ConnEvent::StreamClose {
        stream_id: 0,
        app_error_code: 0,
    }]);
    assert!(h.receive());
    assert_eq!(h.session.stream_count(), 0);
    assert_eq!(h.conn.lock().unwrap().extended_bidi, 1);
}

// ============================================================================
// Close family
// ============================================================================

#[test]
fn test_graceful_close_refuses_new_streams_then_closes() {
    let mut h = Harness::client();
    let id = h.session.open_stream(StreamDirection::Bidirectional).unwrap();
    h.session
        .write_stream(id, Bytes::from(vec![0u8; 64 * 1024]), true, h.now)
        .unwrap();
    h.session.graceful_close(h.now);
    assert!(h.session.is_gracefully_closing());
    assert!(!h.session.is_closing());

    // New local opens are refused.
    assert_eq!(
        h.session.open_stream(StreamDirection::Bidirectional),
        Err(SessionError::GracefulClosing)
    );

    // New peer streams are shut with the closing code.
    h.push_events(vec![ConnEvent::StreamOpen { stream_id: 1 }]);
    assert!(h.receive());
    assert!(h
        .conn
        .lock().unwrap()
        .shutdowns
        .iter()
        .any(|&(sid, code)| sid == 1 && code == APP_NO_ERROR));

    // Existing stream finishes; CONNECTION_CLOSE with NO_ERROR follows.
    h.push_events(vec![ConnEvent::StreamClose {
        stream_id: id,
        app_error_code: 0,
    }]);
    assert!(h.receive());
    assert!(h.session.is_closing());
    let err = h.session.last_error();
    assert_eq!(err.family, ErrorFamily::Application);
    assert!(err.is_no_error());
}

#[test]
fn test_idle_timeout_silent_closes_with_no_error() {
    let mut h = Harness::client();
    h.session.on_idle_timeout(h.now);
    assert!(h.session.is_destroyed());
    let seen = h.seen();
    let silent = seen
        .iter()
        .find(|s| matches!(s, Seen::SilentClose { .. }))
        .unwrap();
    match silent {
        Seen::SilentClose {
            stateless_reset,
            error,
        } => {
            assert!(!stateless_reset);
            assert!(error.is_no_error());
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_destroy_is_idempotent() {
    let mut h = Harness::client();
    h.session.open_stream(StreamDirection::Bidirectional).unwrap();
    h.session.destroy(h.now);
    let first = h.seen();
    let ops = h.session.take_ops();
    h.session.destroy(h.now);
    assert_eq!(h.seen(), first);
    assert!(h.session.take_ops().is_empty());
    assert_eq!(
        ops.iter().filter(|o| **o == SessionOp::Destroyed).count(),
        1
    );
    // Streams were flushed out before the terminal state.
    assert_eq!(h.session.stream_count(), 0);
}

#[test]
fn test_destroy_attempts_one_connection_close() {
    let mut h = Harness::client();
    h.session.destroy(h.now);
    assert_eq!(h.conn.lock().unwrap().close_writes, 1);
    assert_eq!(h.session.take_transmits().len(), 1);
}

#[test]
fn test_close_during_handshake_tears_down_silently() {
    let mut h = Harness::client();
    h.conn.lock().unwrap().close_error = Some(TransportError::InvalidState);
    h.session.close(5, ErrorFamily::Transport, h.now);
    // Unsupported by the transport library mid-handshake: record the
    // error, no frames, silent teardown.
    assert!(h.session.is_destroyed());
    assert!(h.session.take_transmits().is_empty());
    assert!(h
        .seen()
        .iter()
        .any(|s| matches!(s, Seen::SilentClose { .. })));
}

// ============================================================================
// Key update, ping, timers
// ============================================================================

#[test]
fn test_update_key_rotates_and_counts() {
    let tls = FakeTls {
        secrets: vec![LevelSecrets {
            level: CryptoLevel::Application,
            rx: Bytes::from_static(&[1; 32]),
            tx: Bytes::from_static(&[2; 32]),
        }],
        ..Default::default()
    };
    let mut h = Harness::client_with(tls, ClientConfig::default());
    h.push_events(vec![ConnEvent::CryptoData {
        level: CryptoLevel::Handshake,
        offset: 0,
        data: Bytes::from_static(b"fin"),
    }]);
    assert!(h.receive());
    h.session.update_key(h.now).unwrap();
    assert_eq!(h.session.stats().keyupdate_count, 1);
    assert_eq!(h.conn.lock().unwrap().key_updates, 1);
}

#[test]
fn test_update_key_without_secrets_fails() {
    let mut h = Harness::client();
    assert!(h.session.update_key(h.now).is_err());
    assert_eq!(h.session.stats().keyupdate_count, 0);
}

#[test]
fn test_ping_is_noop_when_closing() {
    let mut h = Harness::client();
    h.session.close(0, ErrorFamily::Application, h.now);
    h.session.take_transmits();
    h.session.ping(h.now);
    assert!(h.session.take_transmits().is_empty());
}

#[test]
fn test_retransmit_timeout_without_armed_expiry_is_noop() {
    let mut h = Harness::client();
    h.now += Duration::from_millis(10);
    h.session.on_retransmit_timeout(h.now);
    assert_eq!(h.session.stats().loss_retransmit_count, 0);
    assert_eq!(h.session.stats().ack_delay_retransmit_count, 0);

    // Sending arms the session-visible idle deadline.
    let id = h.session.open_stream(StreamDirection::Bidirectional).unwrap();
    h.session
        .write_stream(id, Bytes::from_static(b"probe"), false, h.now)
        .unwrap();
    assert!(h.session.next_timeout().is_some());
}

#[test]
fn test_version_negotiation_surfaces_versions() {
    let mut h = Harness::client();
    h.push_events(vec![ConnEvent::VersionNegotiation {
        requested: 0xff00_001d,
        versions: vec![1, 0xff00_001d],
    }]);
    assert!(h.receive());
    assert!(h
        .seen()
        .contains(&Seen::VersionNegotiation(0xff00_001d, vec![1, 0xff00_001d])));
}

#[test]
fn test_path_validation_counts() {
    let mut h = Harness::client();
    h.push_events(vec![
        ConnEvent::PathValidation {
            result: PathValidationResult::Success,
            local: h.local,
            remote: h.remote,
        },
        ConnEvent::PathValidation {
            result: PathValidationResult::Failure,
            local: h.local,
            remote: h.remote,
        },
    ]);
    assert!(h.receive());
    assert_eq!(h.session.stats().path_validation_success_count, 1);
    assert_eq!(h.session.stats().path_validation_failure_count, 1);
}

// ============================================================================
// Migration and preferred address
// ============================================================================

#[test]
fn test_client_migration_switches_path() {
    let mut h = Harness::client();
    let new_local: SocketAddr = "127.0.0.1:4001".parse().unwrap();
    h.session.migrate(new_local, h.now).unwrap();
    assert_eq!(h.session.local_address(), new_local);
    assert_eq!(h.conn.lock().unwrap().migrations.len(), 1);
}

#[test]
fn test_server_cannot_migrate() {
    let mut h = Harness::server();
    let new_local: SocketAddr = "127.0.0.1:4001".parse().unwrap();
    assert!(h.session.migrate(new_local, h.now).is_err());
}

#[test]
fn test_preferred_address_policy_accept() {
    let config = ClientConfig {
        preferred_address_policy: PreferredAddressPolicy::Accept,
        ..ClientConfig::default()
    };
    let mut h = Harness::client_with(FakeTls::default(), config);
    let preferred = crate::config::PreferredAddress {
        ipv4: Some(("192.0.2.7".parse().unwrap(), 4434)),
        ipv6: None,
        cid: ConnectionId::from_slice(&[5; 8]).unwrap(),
        stateless_reset_token: [3; 16],
    };
    h.push_events(vec![ConnEvent::SelectPreferredAddress {
        preferred: preferred.clone(),
    }]);
    assert!(h.receive());
    let expected: SocketAddr = "192.0.2.7:4434".parse().unwrap();
    assert_eq!(h.session.remote_address(), expected);
    assert_eq!(h.session.pscid(), Some(&preferred.cid));
    assert!(h.seen().contains(&Seen::UsePreferredAddress(expected)));
}

#[test]
fn test_preferred_address_policy_ignore() {
    let mut h = Harness::client();
    h.push_events(vec![ConnEvent::SelectPreferredAddress {
        preferred: crate::config::PreferredAddress {
            ipv4: Some(("192.0.2.7".parse().unwrap(), 4434)),
            ipv6: None,
            cid: ConnectionId::from_slice(&[5; 8]).unwrap(),
            stateless_reset_token: [3; 16],
        },
    }]);
    let before = h.session.remote_address();
    assert!(h.receive());
    assert_eq!(h.session.remote_address(), before);
}

// ============================================================================
// CID registry ops
// ============================================================================

#[test]
fn test_cid_lifecycle_queues_socket_ops() {
    let mut h = Harness::client();
    let cid = ConnectionId::from_slice(&[1, 2, 3]).unwrap();
    let token = [0x44u8; 16];
    h.push_events(vec![ConnEvent::NewConnectionId {
        cid: cid.clone(),
        reset_token: token,
    }]);
    assert!(h.receive());
    let ops = h.session.take_ops();
    assert!(ops.contains(&SessionOp::AssociateCid(cid.clone())));
    assert!(ops.contains(&SessionOp::AssociateResetToken(token)));

    h.push_events(vec![ConnEvent::RemoveConnectionId {
        cid: cid.clone(),
        reset_token: token,
    }]);
    assert!(h.receive());
    let ops = h.session.take_ops();
    assert!(ops.contains(&SessionOp::DisassociateCid(cid)));
    assert!(ops.contains(&SessionOp::DisassociateResetToken(token)));
}
