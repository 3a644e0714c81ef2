//! Retry tokens and stateless-reset tokens.
//!
//! Both are keyed-hash constructions over per-socket secrets: tokens must
//! be verifiable by this socket alone, without per-client state. A retry
//! token binds the client address and the original DCID to a bounded
//! lifetime; a reset token is a pure function of the CID so it can be
//! recomputed when all connection state is gone.

use bytes::Bytes;
use quion_quic::transport::CidGenerator;
use quion_quic::types::{
    ConnectionId, StatelessResetToken, MAX_CID_LENGTH, RESET_SECRET_LENGTH,
    STATELESS_RESET_TOKEN_LENGTH,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Length of the random salt inside a retry token.
const TOKEN_RAND_LENGTH: usize = 16;

/// Length of the authentication tag inside a retry token.
const TOKEN_TAG_LENGTH: usize = 16;

fn addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

fn token_tag(
    secret: &[u8],
    expiry_ms: u64,
    addr: &SocketAddr,
    ocid: &ConnectionId,
    salt: &[u8],
) -> [u8; TOKEN_TAG_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(expiry_ms.to_be_bytes());
    hasher.update(addr_bytes(addr));
    hasher.update(ocid.as_bytes());
    hasher.update(salt);
    let digest = hasher.finalize();
    let mut tag = [0u8; TOKEN_TAG_LENGTH];
    tag.copy_from_slice(&digest[..TOKEN_TAG_LENGTH]);
    tag
}

/// Generate a retry token binding `remote` and the original DCID for
/// `lifetime`.
///
/// Layout: expiry-ms (8) | ocid-len (1) | ocid | salt (16) | tag (16).
pub fn generate_retry_token(
    secret: &[u8],
    remote: &SocketAddr,
    ocid: &ConnectionId,
    lifetime: Duration,
) -> Bytes {
    let expiry = SystemTime::now() + lifetime;
    let expiry_ms = expiry
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut salt = [0u8; TOKEN_RAND_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    let tag = token_tag(secret, expiry_ms, remote, ocid, &salt);

    let mut token = Vec::with_capacity(8 + 1 + ocid.len() + TOKEN_RAND_LENGTH + TOKEN_TAG_LENGTH);
    token.extend_from_slice(&expiry_ms.to_be_bytes());
    token.push(ocid.len() as u8);
    token.extend_from_slice(ocid.as_bytes());
    token.extend_from_slice(&salt);
    token.extend_from_slice(&tag);
    Bytes::from(token)
}

/// Validate a retry token against the sending address. Returns the
/// original DCID on success.
pub fn validate_retry_token(
    secret: &[u8],
    token: &[u8],
    remote: &SocketAddr,
) -> Option<ConnectionId> {
    if token.len() < 8 + 1 + TOKEN_RAND_LENGTH + TOKEN_TAG_LENGTH {
        return None;
    }
    let expiry_ms = u64::from_be_bytes(token[..8].try_into().ok()?);
    let ocid_len = token[8] as usize;
    if ocid_len > MAX_CID_LENGTH
        || token.len() != 8 + 1 + ocid_len + TOKEN_RAND_LENGTH + TOKEN_TAG_LENGTH
    {
        return None;
    }
    let ocid = ConnectionId::from_slice(&token[9..9 + ocid_len])?;
    let salt = &token[9 + ocid_len..9 + ocid_len + TOKEN_RAND_LENGTH];
    let tag = &token[9 + ocid_len + TOKEN_RAND_LENGTH..];

    let expected = token_tag(secret, expiry_ms, remote, &ocid, salt);
    if tag != expected {
        return None;
    }

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    if now_ms > expiry_ms {
        return None;
    }
    Some(ocid)
}

/// Stateless reset token for a CID: the leading 16 bytes of a keyed hash,
/// recomputable without connection state.
pub fn reset_token_for_cid(secret: &[u8], cid: &ConnectionId) -> StatelessResetToken {
    debug_assert_eq!(secret.len(), RESET_SECRET_LENGTH);
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(cid.as_bytes());
    let digest = hasher.finalize();
    let mut token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
    token.copy_from_slice(&digest[..STATELESS_RESET_TOKEN_LENGTH]);
    token
}

/// The socket's CID source: random CIDs, reset tokens keyed with the
/// socket's reset secret.
#[derive(Debug)]
pub struct SocketCidGenerator {
    reset_secret: [u8; RESET_SECRET_LENGTH],
}

impl SocketCidGenerator {
    pub fn new(reset_secret: [u8; RESET_SECRET_LENGTH]) -> Self {
        Self { reset_secret }
    }
}

impl CidGenerator for SocketCidGenerator {
    fn generate_cid(&self) -> ConnectionId {
        ConnectionId::random()
    }

    fn reset_token(&self, cid: &ConnectionId) -> StatelessResetToken {
        reset_token_for_cid(&self.reset_secret, cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_retry_token_round_trip() {
        let secret = [0x11u8; 16];
        let remote = addr("192.0.2.1:5000");
        let ocid = ConnectionId::from_slice(&[1, 2, 3, 4, 5]).unwrap();
        let token = generate_retry_token(&secret, &remote, &ocid, Duration::from_secs(10));
        let validated = validate_retry_token(&secret, &token, &remote).unwrap();
        assert_eq!(validated, ocid);
    }

    #[test]
    fn test_retry_token_binds_address() {
        let secret = [0x11u8; 16];
        let ocid = ConnectionId::from_slice(&[1, 2, 3, 4, 5]).unwrap();
        let token =
            generate_retry_token(&secret, &addr("192.0.2.1:5000"), &ocid, Duration::from_secs(10));
        assert!(validate_retry_token(&secret, &token, &addr("192.0.2.2:5000")).is_none());
        assert!(validate_retry_token(&secret, &token, &addr("192.0.2.1:5001")).is_none());
    }

    #[test]
    fn test_retry_token_expires() {
        let secret = [0x11u8; 16];
        let remote = addr("192.0.2.1:5000");
        let ocid = ConnectionId::from_slice(&[1, 2, 3]).unwrap();
        let token = generate_retry_token(&secret, &remote, &ocid, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(validate_retry_token(&secret, &token, &remote).is_none());
    }

    #[test]
    fn test_retry_token_rejects_tampering() {
        let secret = [0x11u8; 16];
        let remote = addr("192.0.2.1:5000");
        let ocid = ConnectionId::from_slice(&[1, 2, 3]).unwrap();
        let token = generate_retry_token(&secret, &remote, &ocid, Duration::from_secs(10));
        let mut bad = token.to_vec();
        let tail = bad.len() - 1;
        bad[tail] ^= 0xff;
        assert!(validate_retry_token(&secret, &bad, &remote).is_none());
        assert!(validate_retry_token(&[0x22u8; 16], &token, &remote).is_none());
    }

    #[test]
    fn test_reset_token_is_deterministic_per_cid() {
        let secret = [0x33u8; 16];
        let a = ConnectionId::from_slice(&[1; 8]).unwrap();
        let b = ConnectionId::from_slice(&[2; 8]).unwrap();
        assert_eq!(reset_token_for_cid(&secret, &a), reset_token_for_cid(&secret, &a));
        assert_ne!(reset_token_for_cid(&secret, &a), reset_token_for_cid(&secret, &b));
    }

    #[test]
    fn test_cid_generator_tokens_match_direct_derivation() {
        let secret = [0x44u8; 16];
        let gen = SocketCidGenerator::new(secret);
        let cid = gen.generate_cid();
        assert_eq!(gen.reset_token(&cid), reset_token_for_cid(&secret, &cid));
    }
}
