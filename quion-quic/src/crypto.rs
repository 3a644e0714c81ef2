//! The TLS bridge: handshake bytes in and out of the TLS provider.
//!
//! Outbound handshake data must stay resident until the peer acknowledges
//! it, so each crypto level owns an append-only [`QuicBuffer`] consumed by
//! [`CryptoContext::acknowledge`]. A peer that withholds crypto acks can
//! pin this memory; the session tracks ack latency for that reason.

use bytes::Bytes;
use tracing::debug;

use crate::buffer::QuicBuffer;
use crate::error::SessionError;
use crate::transport::TransportConnection;
use crate::types::Side;

// ============================================================================
// Crypto levels
// ============================================================================

/// Encryption level for handshake data. Each level has independent keys and
/// an independent ack stream. 0-RTT data shares the application buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CryptoLevel {
    Initial = 0,
    Handshake = 1,
    Application = 2,
}

impl CryptoLevel {
    pub fn name(self) -> &'static str {
        match self {
            CryptoLevel::Initial => "initial",
            CryptoLevel::Handshake => "handshake",
            CryptoLevel::Application => "application",
        }
    }
}

// ============================================================================
// TLS provider contract
// ============================================================================

/// Result of feeding handshake bytes to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Processing continued normally.
    Ok,
    /// Paused awaiting the host's OCSP/certificate callback.
    WantX509Lookup,
    /// Paused awaiting the host's client-hello callback.
    WantClientHelloCb,
}

/// Traffic secrets for one crypto level.
#[derive(Debug, Clone)]
pub struct LevelSecrets {
    pub level: CryptoLevel,
    pub rx: Bytes,
    pub tx: Bytes,
}

/// Peer-certificate verification failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub reason: String,
    pub code: i64,
}

/// One TLS 1.3 session, as consumed by the bridge.
///
/// Output (handshake bytes, secrets, keylog lines) accumulates inside the
/// provider and is drained with the `take_*` methods after every call that
/// can advance the handshake.
pub trait TlsSession: Send {
    /// Feed peer handshake bytes at a level. An empty slice resumes a
    /// paused handshake. Errors carry the TLS alert number.
    fn read_handshake(&mut self, level: CryptoLevel, data: &[u8]) -> Result<HandshakeStatus, u8>;

    /// Outbound handshake bytes produced since the last drain.
    fn take_outbound(&mut self) -> Vec<(CryptoLevel, Bytes)>;

    /// Traffic secrets derived since the last drain.
    fn take_secrets(&mut self) -> Vec<LevelSecrets>;

    /// Keylog lines produced since the last drain.
    fn take_keylog(&mut self) -> Vec<String>;

    fn is_handshake_complete(&self) -> bool;

    fn alpn(&self) -> Option<String>;
    fn cipher(&self) -> Option<String>;
    fn cipher_version(&self) -> Option<String>;
    fn servername(&self) -> Option<String>;

    /// Cipher list offered in the ClientHello (server side).
    fn hello_ciphers(&self) -> Vec<String>;

    /// Verify the peer certificate chain; clients additionally match
    /// `hostname` unless `verify_hostname` is false.
    fn verify_peer(&self, hostname: &str, verify_hostname: bool) -> Result<(), VerifyError>;

    /// Derive the next generation of application traffic secrets from the
    /// current pair.
    fn update_traffic_secrets(&mut self, rx: &[u8], tx: &[u8]) -> (Bytes, Bytes);

    /// Peer transport parameters carried in the TLS extension.
    fn peer_transport_params(&self) -> Option<Bytes>;

    /// Install the local transport parameters into the TLS extension.
    fn set_local_transport_params(&mut self, blob: Bytes);

    /// Serialized session ticket issued by the peer, if one arrived.
    fn take_session_ticket(&mut self) -> Option<Bytes>;

    /// Restore a ticket from a previous session (enables resumption).
    fn set_session_ticket(&mut self, ticket: &[u8]) -> bool;

    /// Server: stage an OCSP response for transmission.
    fn set_ocsp_response(&mut self, response: Bytes);

    /// Client: OCSP response received from the server, if any.
    fn take_ocsp_response(&mut self) -> Option<Bytes>;

    /// Whether early data was accepted for this session.
    fn early_data(&self) -> bool;
}

/// Creates TLS sessions from the host's secure context.
pub trait TlsFactory: Send + Sync {
    fn new_session(
        &self,
        side: Side,
        hostname: Option<&str>,
        alpn: &str,
        request_ocsp: bool,
    ) -> Box<dyn TlsSession>;
}

// ============================================================================
// The bridge
// ============================================================================

/// Pause state of the handshake, when a host callback is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePause {
    None,
    /// `client_hello` callback outstanding.
    ClientHello,
    /// `cert`/OCSP callback outstanding.
    Cert,
}

/// Encapsulates the TLS handshake on behalf of one session.
pub struct CryptoContext {
    tls: Box<dyn TlsSession>,
    side: Side,
    handshake: [QuicBuffer; 3],
    handshake_started: bool,
    pause: HandshakePause,
    key_update_in_progress: bool,
    verify_hostname: bool,
    /// Current application-level secrets, kept for the next key update.
    rx_secret: Option<Bytes>,
    tx_secret: Option<Bytes>,
}

impl CryptoContext {
    pub fn new(tls: Box<dyn TlsSession>, side: Side, verify_hostname: bool) -> Self {
        Self {
            tls,
            side,
            handshake: [QuicBuffer::new(), QuicBuffer::new(), QuicBuffer::new()],
            handshake_started: false,
            pause: HandshakePause::None,
            key_update_in_progress: false,
            // Hostname matching only ever applies to clients.
            verify_hostname: verify_hostname && side.is_client(),
            rx_secret: None,
            tx_secret: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn tls(&self) -> &dyn TlsSession {
        self.tls.as_ref()
    }

    pub fn tls_mut(&mut self) -> &mut dyn TlsSession {
        self.tls.as_mut()
    }

    pub fn is_handshake_started(&self) -> bool {
        self.handshake_started
    }

    pub fn mark_handshake_started(&mut self) {
        self.handshake_started = true;
    }

    pub fn pause(&self) -> HandshakePause {
        self.pause
    }

    pub fn is_key_update_in_progress(&self) -> bool {
        self.key_update_in_progress
    }

    /// Unacknowledged outbound handshake bytes at `level`.
    pub fn buffered(&self, level: CryptoLevel) -> usize {
        self.handshake[level as usize].len()
    }

    /// Feed peer handshake bytes into the provider, then flush whatever the
    /// provider produced into the transport connection. `WANT_*` statuses
    /// pause the handshake without error.
    pub fn receive(
        &mut self,
        conn: &mut dyn TransportConnection,
        level: CryptoLevel,
        data: &[u8],
    ) -> Result<(), SessionError> {
        self.handshake_started = true;
        let status = self
            .tls
            .read_handshake(level, data)
            .map_err(SessionError::Crypto)?;
        match status {
            HandshakeStatus::Ok => self.pause = HandshakePause::None,
            HandshakeStatus::WantClientHelloCb => {
                debug!("TLS handshake paused for client hello callback");
                self.pause = HandshakePause::ClientHello;
            }
            HandshakeStatus::WantX509Lookup => {
                debug!("TLS handshake paused for certificate callback");
                self.pause = HandshakePause::Cert;
            }
        }
        self.flush_provider(conn)
    }

    /// Resume a handshake paused on a host callback.
    pub fn resume(&mut self, conn: &mut dyn TransportConnection) -> Result<(), SessionError> {
        self.pause = HandshakePause::None;
        self.receive(conn, CryptoLevel::Handshake, &[])
    }

    /// Submit a chunk of provider output: copy it into the level buffer so
    /// retransmission never aliases the provider's storage, and hand the
    /// copy to the transport library.
    pub fn write_handshake(
        &mut self,
        conn: &mut dyn TransportConnection,
        level: CryptoLevel,
        data: Bytes,
    ) -> Result<(), SessionError> {
        debug!(len = data.len(), level = level.name(), "writing handshake data");
        conn.submit_crypto_data(level, data.clone())
            .map_err(|e| SessionError::Transport(e.code()))?;
        self.handshake[level as usize].push(data);
        Ok(())
    }

    /// Drain provider output (handshake bytes and freshly derived
    /// secrets) into the transport connection.
    pub fn flush_provider(
        &mut self,
        conn: &mut dyn TransportConnection,
    ) -> Result<(), SessionError> {
        for (level, data) in self.tls.take_outbound() {
            self.write_handshake(conn, level, data)?;
        }
        for secrets in self.tls.take_secrets() {
            if secrets.level == CryptoLevel::Application {
                self.rx_secret = Some(secrets.rx.clone());
                self.tx_secret = Some(secrets.tx.clone());
            }
            conn.install_secrets(secrets.level, secrets.rx, secrets.tx)
                .map_err(|e| SessionError::Transport(e.code()))?;
        }
        Ok(())
    }

    /// Drain pending keylog lines.
    pub fn take_keylog(&mut self) -> Vec<String> {
        self.tls.take_keylog()
    }

    /// The peer acknowledged `datalen` crypto bytes at `level`; free them.
    pub fn acknowledge(&mut self, level: CryptoLevel, datalen: usize) {
        debug!(datalen, level = level.name(), "acknowledging crypto data");
        self.handshake[level as usize].consume(datalen);
    }

    /// Rotate the application secrets and install them into the transport.
    /// Fails if an update is already in progress or the handshake has not
    /// produced application secrets yet.
    pub fn initiate_key_update(
        &mut self,
        conn: &mut dyn TransportConnection,
        now: std::time::Instant,
    ) -> Result<(), SessionError> {
        if self.key_update_in_progress {
            return Err(SessionError::KeyUpdateInProgress);
        }
        let (rx, tx) = match (&self.rx_secret, &self.tx_secret) {
            (Some(rx), Some(tx)) => (rx.clone(), tx.clone()),
            _ => return Err(SessionError::Transport(crate::transport::TransportError::InvalidState.code())),
        };
        self.key_update_in_progress = true;
        let result = (|| {
            let (new_rx, new_tx) = self.tls.update_traffic_secrets(&rx, &tx);
            conn.initiate_key_update(new_rx.clone(), new_tx.clone(), now)
                .map_err(|e| SessionError::Transport(e.code()))?;
            self.rx_secret = Some(new_rx);
            self.tx_secret = Some(new_tx);
            Ok(())
        })();
        self.key_update_in_progress = false;
        result
    }

    /// Adopt secrets from a peer-initiated key update.
    pub fn on_remote_key_update(&mut self, rx: Bytes, tx: Bytes) {
        self.rx_secret = Some(rx);
        self.tx_secret = Some(tx);
    }

    /// Verify the peer identity after handshake completion. Servers check
    /// chain trust only; clients additionally match the hostname unless
    /// explicitly disabled.
    pub fn verify_peer_identity(&self, hostname: &str) -> Result<(), VerifyError> {
        self.tls.verify_peer(hostname, self.verify_hostname)
    }

    /// Tear down the buffers, returning the number of handshake bytes the
    /// peer never acknowledged.
    pub fn cancel(&mut self) -> usize {
        self.handshake.iter_mut().map(QuicBuffer::cancel).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal provider: echoes a fixed flight per level on demand.
    #[derive(Default)]
    struct ScriptedTls {
        outbound: Vec<(CryptoLevel, Bytes)>,
        secrets: Vec<LevelSecrets>,
        complete: bool,
        status: Option<HandshakeStatus>,
    }

    impl TlsSession for ScriptedTls {
        fn read_handshake(
            &mut self,
            _level: CryptoLevel,
            _data: &[u8],
        ) -> Result<HandshakeStatus, u8> {
            Ok(self.status.take().unwrap_or(HandshakeStatus::Ok))
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
            None
        }
        fn cipher_version(&self) -> Option<String> {
            None
        }
        fn servername(&self) -> Option<String> {
            None
        }
        fn hello_ciphers(&self) -> Vec<String> {
            Vec::new()
        }
        fn verify_peer(&self, _hostname: &str, _verify: bool) -> Result<(), VerifyError> {
            Ok(())
        }
        fn update_traffic_secrets(&mut self, rx: &[u8], tx: &[u8]) -> (Bytes, Bytes) {
            let bump = |s: &[u8]| {
                let mut v = s.to_vec();
                v.iter_mut().for_each(|b| *b = b.wrapping_add(1));
                Bytes::from(v)
            };
            (bump(rx), bump(tx))
        }
        fn peer_transport_params(&self) -> Option<Bytes> {
            None
        }
        fn set_local_transport_params(&mut self, _blob: Bytes) {}
        fn take_session_ticket(&mut self) -> Option<Bytes> {
            None
        }
        fn set_session_ticket(&mut self, _ticket: &[u8]) -> bool {
            false
        }
        fn set_ocsp_response(&mut self, _response: Bytes) {}
        fn take_ocsp_response(&mut self) -> Option<Bytes> {
            None
        }
        fn early_data(&self) -> bool {
            false
        }
    }

    /// Transport stub recording crypto submissions.
    #[derive(Default)]
    struct RecordingConn {
        submitted: Vec<(CryptoLevel, Bytes)>,
        installed: Vec<CryptoLevel>,
        key_updates: usize,
    }

    impl TransportConnection for RecordingConn {
        fn read_packet(
            &mut self,
            _path: &crate::transport::Path,
            _data: &[u8],
            _now: std::time::Instant,
            _events: &mut Vec<crate::transport::ConnEvent>,
        ) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }
        fn writev_stream(
            &mut self,
            _buf: &mut [u8],
            _stream_id: Option<i64>,
            _data: &[&[u8]],
            _fin: bool,
            _now: std::time::Instant,
        ) -> Result<crate::transport::StreamWrite, crate::transport::TransportError> {
            Ok(crate::transport::StreamWrite {
                packet_len: 0,
                consumed: None,
            })
        }
        fn write_connection_close(
            &mut self,
            _buf: &mut [u8],
            _error: crate::error::QuicError,
            _now: std::time::Instant,
        ) -> Result<usize, crate::transport::TransportError> {
            Ok(0)
        }
        fn submit_crypto_data(
            &mut self,
            level: CryptoLevel,
            data: Bytes,
        ) -> Result<(), crate::transport::TransportError> {
            self.submitted.push((level, data));
            Ok(())
        }
        fn install_secrets(
            &mut self,
            level: CryptoLevel,
            _rx: Bytes,
            _tx: Bytes,
        ) -> Result<(), crate::transport::TransportError> {
            self.installed.push(level);
            Ok(())
        }
        fn initiate_key_update(
            &mut self,
            _rx: Bytes,
            _tx: Bytes,
            _now: std::time::Instant,
        ) -> Result<(), crate::transport::TransportError> {
            self.key_updates += 1;
            Ok(())
        }
        fn install_initial_key(
            &mut self,
            _dcid: &crate::types::ConnectionId,
        ) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }
        fn shutdown_stream(
            &mut self,
            _stream_id: i64,
            _code: u64,
        ) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }
        fn shutdown_stream_read(
            &mut self,
            _stream_id: i64,
            _code: u64,
        ) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }
        fn open_bidi_stream(&mut self) -> Result<i64, crate::transport::TransportError> {
            Ok(0)
        }
        fn open_uni_stream(&mut self) -> Result<i64, crate::transport::TransportError> {
            Ok(2)
        }
        fn is_local_stream(&self, _stream_id: i64) -> bool {
            false
        }
        fn extend_max_offset(&mut self, _amount: u64) {}
        fn extend_max_stream_offset(&mut self, _stream_id: i64, _amount: u64) {}
        fn extend_max_streams_bidi(&mut self, _n: u64) {}
        fn extend_max_streams_uni(&mut self, _n: u64) {}
        fn is_in_closing_period(&self) -> bool {
            false
        }
        fn is_in_draining_period(&self) -> bool {
            false
        }
        fn idle_expiry(&self) -> std::time::Instant {
            std::time::Instant::now()
        }
        fn loss_detection_expiry(&self) -> Option<std::time::Instant> {
            None
        }
        fn ack_delay_expiry(&self) -> Option<std::time::Instant> {
            None
        }
        fn next_expiry(&self) -> Option<std::time::Instant> {
            None
        }
        fn on_loss_detection_timeout(
            &mut self,
            _now: std::time::Instant,
        ) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }
        fn cancel_expired_ack_delay(&mut self, _now: std::time::Instant) {}
        fn source_cids(&self) -> Vec<crate::types::ConnectionId> {
            Vec::new()
        }
        fn dcid(&self) -> crate::types::ConnectionId {
            crate::types::ConnectionId::empty()
        }
        fn active_reset_tokens(&self) -> Vec<crate::types::StatelessResetToken> {
            Vec::new()
        }
        fn local_transport_params(&self) -> crate::config::TransportParams {
            crate::config::TransportParams::default()
        }
        fn remote_transport_params(&self) -> Option<crate::config::TransportParams> {
            None
        }
        fn set_early_remote_transport_params(&mut self, _params: &crate::config::TransportParams) {}
        fn negotiated_version(&self) -> u32 {
            crate::types::VERSION_1
        }
        fn max_data_left(&self) -> u64 {
            u64::MAX
        }
        fn bytes_in_flight(&self) -> u64 {
            0
        }
        fn recovery_stats(&self) -> crate::transport::RecoveryStats {
            crate::transport::RecoveryStats::default()
        }
        fn initiate_migration(
            &mut self,
            _path: &crate::transport::Path,
            _now: std::time::Instant,
        ) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }
    }

    fn ctx_with(tls: ScriptedTls) -> CryptoContext {
        CryptoContext::new(Box::new(tls), Side::Client, true)
    }

    #[test]
    fn test_receive_flushes_provider_output() {
        let tls = ScriptedTls {
            outbound: vec![(CryptoLevel::Initial, Bytes::from_static(b"hello-flight"))],
            ..Default::default()
        };
        let mut ctx = ctx_with(tls);
        let mut conn = RecordingConn::default();
        ctx.receive(&mut conn, CryptoLevel::Initial, b"ch").unwrap();
        assert_eq!(conn.submitted.len(), 1);
        assert_eq!(ctx.buffered(CryptoLevel::Initial), 12);
        assert!(ctx.is_handshake_started());
    }

    #[test]
    fn test_acknowledge_advances_buffer_head() {
        let mut ctx = ctx_with(ScriptedTls::default());
        let mut conn = RecordingConn::default();
        ctx.write_handshake(&mut conn, CryptoLevel::Handshake, Bytes::from_static(b"0123456789"))
            .unwrap();
        ctx.acknowledge(CryptoLevel::Handshake, 4);
        assert_eq!(ctx.buffered(CryptoLevel::Handshake), 6);
        ctx.acknowledge(CryptoLevel::Handshake, 6);
        assert_eq!(ctx.buffered(CryptoLevel::Handshake), 0);
    }

    #[test]
    fn test_want_client_hello_pauses_without_error() {
        let tls = ScriptedTls {
            status: Some(HandshakeStatus::WantClientHelloCb),
            ..Default::default()
        };
        let mut ctx = ctx_with(tls);
        let mut conn = RecordingConn::default();
        ctx.receive(&mut conn, CryptoLevel::Initial, b"ch").unwrap();
        assert_eq!(ctx.pause(), HandshakePause::ClientHello);
        ctx.resume(&mut conn).unwrap();
        assert_eq!(ctx.pause(), HandshakePause::None);
    }

    #[test]
    fn test_key_update_requires_app_secrets() {
        let mut ctx = ctx_with(ScriptedTls::default());
        let mut conn = RecordingConn::default();
        assert!(ctx.initiate_key_update(&mut conn, std::time::Instant::now()).is_err());

        let tls = ScriptedTls {
            secrets: vec![LevelSecrets {
                level: CryptoLevel::Application,
                rx: Bytes::from_static(&[1; 32]),
                tx: Bytes::from_static(&[2; 32]),
            }],
            ..Default::default()
        };
        let mut ctx = ctx_with(tls);
        ctx.receive(&mut conn, CryptoLevel::Handshake, b"fin").unwrap();
        ctx.initiate_key_update(&mut conn, std::time::Instant::now()).unwrap();
        assert_eq!(conn.key_updates, 1);
        assert!(!ctx.is_key_update_in_progress());
    }

    #[test]
    fn test_cancel_reports_leaked_bytes() {
        let mut ctx = ctx_with(ScriptedTls::default());
        let mut conn = RecordingConn::default();
        ctx.write_handshake(&mut conn, CryptoLevel::Initial, Bytes::from_static(b"abc"))
            .unwrap();
        ctx.write_handshake(&mut conn, CryptoLevel::Application, Bytes::from_static(b"defg"))
            .unwrap();
        ctx.acknowledge(CryptoLevel::Initial, 3);
        assert_eq!(ctx.cancel(), 4);
    }
}
