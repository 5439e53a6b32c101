//! Protocol module - Defines the wire protocol for meshbus transport
//!
//! One TCP stream per peer pair carries:
//! - A single 24-byte handshake header in each direction, sent immediately
//!   after the socket connects (magic, version, node id)
//! - Then repeated frames: 2 bytes payload length (big-endian) followed by
//!   the opaque serialized message payload
//!
//! There is no checksum or trailer; a peer presenting a mismatched magic or
//! version is simply dropped.

mod header;
mod codec;
mod message;

pub use header::*;
pub use codec::*;
pub use message::*;

use std::fmt;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for meshbus peer connections
pub const DEFAULT_PORT: u16 = 6440;

/// Magic constant for protocol identification ("MBUS")
pub const MAGIC: u32 = 0x4D42_5553;

/// Handshake header size: magic(4) + version(4) + node id(16)
pub const WIRE_HEADER_SIZE: usize = 24;

/// A frame payload must fit the 16-bit length prefix
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Defensive parser limit on recipient addresses per message (inclusive)
pub const MAX_RECIPIENTS: usize = 1024;

/// Defensive parser limit on annotations per message (inclusive)
pub const MAX_ANNOTATIONS: usize = 128;

/// The addressable identity of a peer process.
///
/// Generated once per transport at startup and exchanged during the
/// handshake; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(uuid::Uuid);

impl NodeId {
    /// Generate a fresh random node id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// The all-zero node id, never valid on the wire
    pub fn nil() -> Self {
        Self(uuid::Uuid::nil())
    }

    /// A node id is valid iff it is non-zero
    pub fn is_valid(&self) -> bool {
        !self.0.is_nil()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
