//! Socket-level configuration.

use quion_quic::config::TransportParams;
use quion_quic::types::{
    RESET_SECRET_LENGTH, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_CONNECTIONS_PER_HOST,
    DEFAULT_MAX_STATELESS_RESETS_PER_HOST, DEFAULT_RETRY_TOKEN_TIMEOUT, MAX_RETRY_TOKEN_TIMEOUT,
    MIN_RETRY_TOKEN_TIMEOUT,
};
use rand::RngCore;
use std::time::Duration;

/// Options governing server admission and stateless behavior.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Demand address validation via Retry before committing state.
    pub validate_address: bool,
    /// Remember validated addresses in a small LRU; only meaningful when
    /// `validate_address` is set.
    pub validate_address_lru: bool,
    /// Cap on total live sessions.
    pub max_connections: usize,
    /// Cap on live sessions per remote address.
    pub max_connections_per_host: usize,
    /// Cap on stateless resets emitted per remote address.
    pub max_stateless_resets_per_host: usize,
    /// Retry token lifetime, clamped to [1s, 60s].
    pub retry_token_timeout: Duration,
    /// Secret keying stateless-reset tokens. Exactly 16 bytes.
    pub stateless_reset_secret: [u8; RESET_SECRET_LENGTH],
    /// Never emit stateless resets.
    pub disable_stateless_reset: bool,
    /// CONNECTION_CLOSE code used when refusing an Initial at a cap.
    pub refuse_code: u64,
    /// ALPN identifier offered to accepted sessions.
    pub alpn: String,
    /// Transport parameters for server sessions.
    pub transport_params: TransportParams,
}

impl Default for SocketConfig {
    fn default() -> Self {
        let mut reset_secret = [0u8; RESET_SECRET_LENGTH];
        rand::thread_rng().fill_bytes(&mut reset_secret);
        Self {
            validate_address: false,
            validate_address_lru: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            max_stateless_resets_per_host: DEFAULT_MAX_STATELESS_RESETS_PER_HOST,
            retry_token_timeout: DEFAULT_RETRY_TOKEN_TIMEOUT,
            stateless_reset_secret: reset_secret,
            disable_stateless_reset: false,
            refuse_code: quion_quic::types::SERVER_BUSY,
            alpn: "h3".to_string(),
            transport_params: TransportParams::default(),
        }
    }
}

impl SocketConfig {
    /// Clamp fields to their legal ranges.
    pub fn clamped(mut self) -> Self {
        self.retry_token_timeout = self
            .retry_token_timeout
            .clamp(MIN_RETRY_TOKEN_TIMEOUT, MAX_RETRY_TOKEN_TIMEOUT);
        self
    }
}
