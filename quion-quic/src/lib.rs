//! # quion-quic: QUIC session engine
//!
//! The per-connection state machine for a QUIC (RFC 9000) endpoint:
//! handshake, data transport, migration, key update, and teardown, driven
//! on top of a pluggable transport library and TLS 1.3 provider.
//!
//! ## Architecture
//!
//! ```text
//! quion-quic/
//! ├── types      - CIDs, stream ids, sides, protocol constants
//! ├── error      - Error families and the last-error descriptor
//! ├── varint     - Variable-length integers (RFC 9000 Section 16)
//! ├── buffer     - Ack-consumed byte queues and serialized packets
//! ├── timer      - Single-shot idle/retransmit deadlines
//! ├── config     - Transport parameters and client options
//! ├── crypto     - TLS provider contract and the handshake bridge
//! ├── transport  - Transport-library contract (connections, callbacks)
//! ├── stream     - Stream state and the per-session stream table
//! ├── listener   - Host-facing event surface
//! └── session    - The session state machine itself
//! ```
//!
//! ## Design principles
//!
//! 1. **No I/O here.** The session consumes received datagrams and
//!    produces [`session::Transmit`]s; the `quion` crate owns sockets.
//! 2. **Callbacks never re-enter.** Transport events dispatch behind an
//!    "inside transport callback" marker; sends flush afterwards.
//! 3. **Keyed buffers, ack-driven.** Outbound handshake and stream bytes
//!    stay resident until the peer acknowledges them.
//! 4. **Single loop.** A session and its streams, timers, and TLS bridge
//!    belong to one cooperative loop and are never shared across workers.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod crypto;
pub mod error;
pub mod listener;
pub mod session;
pub mod stream;
pub mod timer;
pub mod transport;
pub mod types;
pub mod varint;

pub use buffer::{QuicBuffer, QuicPacket};
pub use config::{ClientConfig, PreferredAddress, PreferredAddressPolicy, TransportParams};
pub use crypto::{CryptoContext, CryptoLevel, TlsFactory, TlsSession};
pub use error::{ErrorFamily, QuicError, SessionError};
pub use listener::{
    HandshakeInfo, NullListener, PathValidationResult, SessionListener, SessionTicket,
};
pub use session::{Session, SessionOp, SessionState, SessionStats, Transmit};
pub use stream::{Stream, StreamMap};
pub use timer::Timer;
pub use transport::{
    CidGenerator, ClientSetup, ConnEvent, Path, ServerSetup, StreamWrite, TransportConnection,
    TransportError, TransportFactory,
};
pub use types::{
    ConnectionId, Side, StatelessResetToken, StreamDirection, StreamId, StreamOrigin, VERSION_1,
};
