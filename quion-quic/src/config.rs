//! Session configuration: transport parameters and client options.
//!
//! [`TransportParams`] carries the settings handed to the transport library
//! when a connection is created, and encodes to the exact byte layout used
//! for 0-RTT resumption: a client stores the blob exported from a previous
//! session and replays it via `early_transport_params`.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::types::{
    ConnectionId, StatelessResetToken, DEFAULT_ACTIVE_CONNECTION_ID_LIMIT, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_DATA, DEFAULT_MAX_STREAMS_BIDI, DEFAULT_MAX_STREAMS_UNI,
    DEFAULT_MAX_STREAM_DATA_BIDI_LOCAL, DEFAULT_MAX_STREAM_DATA_BIDI_REMOTE,
    DEFAULT_MAX_STREAM_DATA_UNI, MAX_PKTLEN_IPV4, STATELESS_RESET_TOKEN_LENGTH,
};
use crate::varint;

// ============================================================================
// Transport parameters
// ============================================================================

/// A server-advertised preferred address (RFC 9000 Section 9.6).
///
/// At least one of the v4/v6 endpoints is present; the advertisement also
/// carries the CID and reset token the client switches to if it migrates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredAddress {
    pub ipv4: Option<(Ipv4Addr, u16)>,
    pub ipv6: Option<(Ipv6Addr, u16)>,
    pub cid: ConnectionId,
    pub stateless_reset_token: StatelessResetToken,
}

/// Transport parameters recognized by the session engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// Number of CIDs the peer may keep active, clamped to 2..=8.
    pub active_connection_id_limit: u64,
    pub max_stream_data_bidi_local: u64,
    pub max_stream_data_bidi_remote: u64,
    pub max_stream_data_uni: u64,
    pub max_data: u64,
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
    pub idle_timeout: Duration,
    pub max_packet_size: u64,
    pub max_ack_delay: Duration,
    pub preferred_address: Option<PreferredAddress>,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            active_connection_id_limit: DEFAULT_ACTIVE_CONNECTION_ID_LIMIT,
            max_stream_data_bidi_local: DEFAULT_MAX_STREAM_DATA_BIDI_LOCAL,
            max_stream_data_bidi_remote: DEFAULT_MAX_STREAM_DATA_BIDI_REMOTE,
            max_stream_data_uni: DEFAULT_MAX_STREAM_DATA_UNI,
            max_data: DEFAULT_MAX_DATA,
            max_streams_bidi: DEFAULT_MAX_STREAMS_BIDI,
            max_streams_uni: DEFAULT_MAX_STREAMS_UNI,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_packet_size: MAX_PKTLEN_IPV4 as u64,
            max_ack_delay: Duration::from_millis(25),
            preferred_address: None,
        }
    }
}

// Parameter ids per RFC 9000 Section 18.2 (the subset the engine carries).
const P_MAX_IDLE_TIMEOUT: u64 = 0x01;
const P_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const P_INITIAL_MAX_DATA: u64 = 0x04;
const P_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const P_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const P_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const P_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const P_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const P_MAX_ACK_DELAY: u64 = 0x0b;
const P_PREFERRED_ADDRESS: u64 = 0x0d;
const P_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;

fn put_varint(buf: &mut BytesMut, value: u64) {
    let value = value.min(varint::VARINT_MAX);
    let mut tmp = [0u8; 8];
    if let Some(n) = varint::encode(value, &mut tmp) {
        buf.put_slice(&tmp[..n]);
    }
}

fn put_varint_param(buf: &mut BytesMut, id: u64, value: u64) {
    let value = value.min(varint::VARINT_MAX);
    put_varint(buf, id);
    put_varint(buf, varint::size(value).unwrap_or(8) as u64);
    put_varint(buf, value);
}

impl TransportParams {
    /// Clamp fields to their legal ranges.
    pub fn clamped(mut self) -> Self {
        self.active_connection_id_limit = self.active_connection_id_limit.clamp(2, 8);
        self
    }

    /// Encode to the wire layout of the quic_transport_parameters TLS
    /// extension. This is the blob exported for session resumption.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        put_varint_param(&mut buf, P_MAX_IDLE_TIMEOUT, self.idle_timeout.as_millis() as u64);
        put_varint_param(&mut buf, P_MAX_UDP_PAYLOAD_SIZE, self.max_packet_size);
        put_varint_param(&mut buf, P_INITIAL_MAX_DATA, self.max_data);
        put_varint_param(
            &mut buf,
            P_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.max_stream_data_bidi_local,
        );
        put_varint_param(
            &mut buf,
            P_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.max_stream_data_bidi_remote,
        );
        put_varint_param(&mut buf, P_INITIAL_MAX_STREAM_DATA_UNI, self.max_stream_data_uni);
        put_varint_param(&mut buf, P_INITIAL_MAX_STREAMS_BIDI, self.max_streams_bidi);
        put_varint_param(&mut buf, P_INITIAL_MAX_STREAMS_UNI, self.max_streams_uni);
        put_varint_param(&mut buf, P_MAX_ACK_DELAY, self.max_ack_delay.as_millis() as u64);
        put_varint_param(
            &mut buf,
            P_ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
        if let Some(ref pa) = self.preferred_address {
            put_varint(&mut buf, P_PREFERRED_ADDRESS);
            let body = encode_preferred_address(pa);
            put_varint(&mut buf, body.len() as u64);
            buf.put_slice(&body);
        }
        buf.freeze()
    }

    /// Decode a transport-parameter blob. Unknown parameter ids are skipped,
    /// per RFC 9000 Section 7.4.2. Returns None on framing errors.
    pub fn decode(mut data: &[u8]) -> Option<Self> {
        let mut params = Self::default();
        while !data.is_empty() {
            let (id, n) = varint::decode(data)?;
            data = &data[n..];
            let (len, n) = varint::decode(data)?;
            data = &data[n..];
            let len = len as usize;
            if data.len() < len {
                return None;
            }
            let value = &data[..len];
            data = &data[len..];

            let as_varint = || varint::decode(value).map(|(v, _)| v);
            match id {
                P_MAX_IDLE_TIMEOUT => {
                    params.idle_timeout = Duration::from_millis(as_varint()?);
                }
                P_MAX_UDP_PAYLOAD_SIZE => params.max_packet_size = as_varint()?,
                P_INITIAL_MAX_DATA => params.max_data = as_varint()?,
                P_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.max_stream_data_bidi_local = as_varint()?;
                }
                P_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.max_stream_data_bidi_remote = as_varint()?;
                }
                P_INITIAL_MAX_STREAM_DATA_UNI => params.max_stream_data_uni = as_varint()?,
                P_INITIAL_MAX_STREAMS_BIDI => params.max_streams_bidi = as_varint()?,
                P_INITIAL_MAX_STREAMS_UNI => params.max_streams_uni = as_varint()?,
                P_MAX_ACK_DELAY => params.max_ack_delay = Duration::from_millis(as_varint()?),
                P_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = as_varint()?;
                }
                P_PREFERRED_ADDRESS => {
                    params.preferred_address = Some(decode_preferred_address(value)?);
                }
                _ => {}
            }
        }
        Some(params)
    }
}

fn encode_preferred_address(pa: &PreferredAddress) -> Vec<u8> {
    let mut body = Vec::with_capacity(64);
    let (v4, v4_port) = pa.ipv4.unwrap_or((Ipv4Addr::UNSPECIFIED, 0));
    body.extend_from_slice(&v4.octets());
    body.extend_from_slice(&v4_port.to_be_bytes());
    let (v6, v6_port) = pa.ipv6.unwrap_or((Ipv6Addr::UNSPECIFIED, 0));
    body.extend_from_slice(&v6.octets());
    body.extend_from_slice(&v6_port.to_be_bytes());
    body.push(pa.cid.len() as u8);
    body.extend_from_slice(pa.cid.as_bytes());
    body.extend_from_slice(&pa.stateless_reset_token);
    body
}

fn decode_preferred_address(value: &[u8]) -> Option<PreferredAddress> {
    // 4+2 (v4) + 16+2 (v6) + 1 (cid len) minimum, token trails the cid.
    if value.len() < 25 {
        return None;
    }
    let v4 = Ipv4Addr::new(value[0], value[1], value[2], value[3]);
    let v4_port = u16::from_be_bytes([value[4], value[5]]);
    let mut v6_octets = [0u8; 16];
    v6_octets.copy_from_slice(&value[6..22]);
    let v6 = Ipv6Addr::from(v6_octets);
    let v6_port = u16::from_be_bytes([value[22], value[23]]);
    let cid_len = value[24] as usize;
    let rest = &value[25..];
    if rest.len() != cid_len + STATELESS_RESET_TOKEN_LENGTH {
        return None;
    }
    let cid = ConnectionId::from_slice(&rest[..cid_len])?;
    let mut token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
    token.copy_from_slice(&rest[cid_len..]);
    Some(PreferredAddress {
        ipv4: (!v4.is_unspecified()).then_some((v4, v4_port)),
        ipv6: (!v6.is_unspecified()).then_some((v6, v6_port)),
        cid,
        stateless_reset_token: token,
    })
}

// ============================================================================
// Client session options
// ============================================================================

/// How a client session responds to a server-advertised preferred address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferredAddressPolicy {
    /// Switch to the advertised address when its family matches.
    Accept,
    /// Ignore the advertisement.
    #[default]
    Ignore,
}

/// Options for creating a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub params: TransportParams,
    pub alpn: String,
    pub hostname: String,
    /// Verify the server hostname against its certificate. Required by QUIC;
    /// disabling is supported only for diagnostics.
    pub verify_hostname_identity: bool,
    /// Ask the server for an OCSP response during the handshake.
    pub request_ocsp: bool,
    /// Caller-provided destination CID; generated randomly if absent.
    pub dcid: Option<ConnectionId>,
    /// Transport-parameter blob from a previous session, enabling 0-RTT.
    pub early_transport_params: Option<Bytes>,
    /// Opaque session ticket from a previous session.
    pub session_ticket: Option<Bytes>,
    pub preferred_address_policy: PreferredAddressPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            params: TransportParams::default(),
            alpn: "h3".to_string(),
            hostname: String::new(),
            verify_hostname_identity: true,
            request_ocsp: false,
            dcid: None,
            early_transport_params: None,
            session_ticket: None,
            preferred_address_policy: PreferredAddressPolicy::default(),
        }
    }
}
