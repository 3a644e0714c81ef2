//! Error types for the session engine.
//!
//! A session's terminal condition is always described by a [`QuicError`]:
//! an error family plus a numeric code whose meaning depends on the family.
//! Application codes are only meaningful relative to the negotiated ALPN;
//! transport and crypto codes are protocol-defined.

use thiserror::Error;

use crate::types::NO_ERROR;

/// The namespace a [`QuicError`] code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorFamily {
    /// QUIC transport error codes (RFC 9000 Section 20.1).
    Transport,
    /// Application protocol error codes, scoped to the negotiated ALPN.
    Application,
    /// TLS alerts surfaced as crypto errors (RFC 9001 Section 4.8).
    Crypto,
    /// Failures internal to the session engine itself.
    Session,
}

impl ErrorFamily {
    pub fn name(self) -> &'static str {
        match self {
            ErrorFamily::Transport => "transport",
            ErrorFamily::Application => "application",
            ErrorFamily::Crypto => "crypto",
            ErrorFamily::Session => "session",
        }
    }
}

/// The last-error descriptor carried by every session.
///
/// Overwritten only by more specific information; close routines snapshot it
/// before serializing a CONNECTION_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuicError {
    pub family: ErrorFamily,
    pub code: u64,
}

impl QuicError {
    pub fn new(family: ErrorFamily, code: u64) -> Self {
        Self { family, code }
    }

    /// A crypto error wrapping a TLS alert number.
    pub fn crypto(alert: u8) -> Self {
        Self {
            family: ErrorFamily::Crypto,
            code: alert as u64,
        }
    }

    pub fn is_no_error(&self) -> bool {
        self.code == NO_ERROR
    }
}

impl Default for QuicError {
    /// `NO_ERROR` in the session-internal family, matching the state of a
    /// session that has never recorded a failure.
    fn default() -> Self {
        Self {
            family: ErrorFamily::Session,
            code: NO_ERROR,
        }
    }
}

impl core::fmt::Display for QuicError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} error {}", self.family.name(), self.code)
    }
}

/// Failures surfaced by session-engine operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session has been destroyed and is no longer usable.
    #[error("session is destroyed")]
    Destroyed,

    /// The operation is forbidden while the session is closing.
    #[error("session is closing")]
    Closing,

    /// The operation is forbidden while a graceful close is in progress.
    #[error("session is gracefully closing")]
    GracefulClosing,

    /// Send-capable routine invoked from within a transport callback.
    #[error("operation not permitted inside a transport callback")]
    InsideCallback,

    /// A key update was requested while one is already in progress.
    #[error("key update already in progress")]
    KeyUpdateInProgress,

    /// The transport library rejected the operation.
    #[error("transport failure: {0}")]
    Transport(i32),

    /// A user callback reported failure; the handshake cannot proceed.
    #[error("callback failure")]
    CallbackFailure,

    /// The TLS provider failed the handshake.
    #[error("crypto failure: tls alert {0}")]
    Crypto(u8),

    /// The stream id does not name a live stream on this session.
    #[error("unknown stream {0}")]
    UnknownStream(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_error_is_session_no_error() {
        let err = QuicError::default();
        assert_eq!(err.family, ErrorFamily::Session);
        assert!(err.is_no_error());
    }

    #[test]
    fn test_crypto_error_wraps_alert() {
        let err = QuicError::crypto(80);
        assert_eq!(err.family, ErrorFamily::Crypto);
        assert_eq!(err.code, 80);
        assert_eq!(err.to_string(), "crypto error 80");
    }

    #[test]
    fn test_family_names() {
        assert_eq!(ErrorFamily::Transport.name(), "transport");
        assert_eq!(ErrorFamily::Application.name(), "application");
        assert_eq!(ErrorFamily::Crypto.name(), "crypto");
        assert_eq!(ErrorFamily::Session.name(), "session");
    }
}
