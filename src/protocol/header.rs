//! Handshake header exchanged once per connection
//!
//! Immediately after a socket becomes connected, both peers send a fixed
//! 24-byte header identifying the protocol and their node id. Until both
//! directions have exchanged headers, no payload frames may flow.

use bytes::{Buf, BufMut, BytesMut};

use super::{NodeId, MAGIC, PROTOCOL_VERSION, WIRE_HEADER_SIZE};

/// The fixed-size handshake record: magic, version, node id.
///
/// A pure value type; there is no state machine here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub magic: u32,
    pub version: u32,
    pub node_id: NodeId,
}

impl WireHeader {
    /// Build a header with the compiled-in magic and version
    pub fn new(node_id: NodeId) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            node_id,
        }
    }

    /// Encode into a buffer: magic(4) + version(4) + node id(16), big-endian
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(WIRE_HEADER_SIZE);
        buf.put_u32(self.magic);
        buf.put_u32(self.version);
        buf.put_slice(self.node_id.as_bytes());
    }

    /// Decode a header from the front of the buffer.
    ///
    /// Returns `None` if fewer than 24 bytes are available - the caller
    /// must wait for more data rather than treat this as an error.
    /// Consumes exactly 24 bytes on success.
    pub fn decode(buf: &mut BytesMut) -> Option<WireHeader> {
        if buf.len() < WIRE_HEADER_SIZE {
            return None;
        }

        let magic = buf.get_u32();
        let version = buf.get_u32();
        let mut id_bytes = [0u8; 16];
        buf.copy_to_slice(&mut id_bytes);

        Some(WireHeader {
            magic,
            version,
            node_id: NodeId::from_bytes(id_bytes),
        })
    }

    /// A header is valid iff magic and version match the compiled-in
    /// constants and the node id is non-zero
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC && self.version == PROTOCOL_VERSION && self.node_id.is_valid()
    }
}
