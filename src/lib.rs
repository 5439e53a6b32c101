//! Meshbus - Peer-to-peer TCP message transport
//!
//! A connection-oriented transport that carries addressed, serialized
//! messages between nodes in a distributed pub/sub messaging fabric. The
//! bus bridge embedding this crate drives it through [`TcpTransport`]:
//! start/stop, `transport_message` for unicast and broadcast sends, and a
//! [`TransportEvent`] channel for received messages and node
//! discovery/loss.
//!
//! The wire protocol is a one-time 24-byte handshake header per direction
//! followed by 16-bit length-prefixed frames of opaque serialized message
//! payloads; see the [`protocol`] module. Message payload bodies are never
//! interpreted here - serialization belongs to the bus.

pub mod config;
pub mod net;
pub mod protocol;

pub use config::{ConfigError, TransportConfig};
pub use net::{
    Connection, ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionState, TcpTransport,
    TransportEvent,
};
pub use protocol::{
    DeserializedMessage, MessageError, NodeId, Scope, SerializedMessage, WireHeader,
};
