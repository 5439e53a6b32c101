//! Frame codec for the length-prefixed wire format
//!
//! After the handshake, every message travels as one frame:
//! a 2-byte big-endian payload length followed by the payload bytes.
//! The 16-bit prefix caps a single payload at 65535 bytes; this is a hard
//! limit enforced at encode time.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

use super::MAX_FRAME_PAYLOAD;

/// Size of the frame length prefix
pub const FRAME_PREFIX_SIZE: usize = 2;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max: {MAX_FRAME_PAYLOAD})")]
    PayloadTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Encode one payload as a length-prefixed frame into `buf`
pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) -> Result<(), CodecError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    buf.reserve(FRAME_PREFIX_SIZE + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(())
}

/// Decode one complete frame from the front of `buf`.
///
/// The length prefix is only peeked until the full `2 + length` bytes are
/// available; prefix and payload are consumed together, so a partial read
/// can never desynchronize the stream. Returns `None` when more data is
/// needed.
pub fn decode_frame(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < FRAME_PREFIX_SIZE {
        return None;
    }

    let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < FRAME_PREFIX_SIZE + length {
        return None;
    }

    buf.advance(FRAME_PREFIX_SIZE);
    Some(buf.split_to(length).freeze())
}
