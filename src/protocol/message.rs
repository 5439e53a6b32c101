//! Message types carried by the transport
//!
//! The transport treats a serialized message as an opaque byte blob plus a
//! small envelope of manually-parsed header fields (type name, sender,
//! recipients, scope, timestamps, annotations). Payload body encoding is
//! owned by the bus-side serializer and never inspected here.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use super::{NodeId, MAX_ANNOTATIONS, MAX_RECIPIENTS};

/// Message decode errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Truncated message envelope")]
    Truncated,

    #[error("Too many recipients: {0} (max: {MAX_RECIPIENTS})")]
    TooManyRecipients(usize),

    #[error("Too many annotations: {0} (max: {MAX_ANNOTATIONS})")]
    TooManyAnnotations(usize),

    #[error("Invalid scope ordinal: {0}")]
    InvalidScope(u8),

    #[error("Invalid UTF-8 in envelope string")]
    InvalidUtf8,
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Delivery scope of a message, capped at a known maximum ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Scope {
    /// Deliver within the sending thread only
    Thread = 0,
    /// Deliver within the sending process only
    Process = 1,
    /// Deliver to the network, excluding the sending process
    Network = 2,
    /// Deliver everywhere
    All = 3,
}

impl Scope {
    /// Largest valid ordinal
    pub const MAX: u8 = Scope::All as u8;

    pub fn from_u8(value: u8) -> MessageResult<Self> {
        match value {
            0 => Ok(Scope::Thread),
            1 => Ok(Scope::Process),
            2 => Ok(Scope::Network),
            3 => Ok(Scope::All),
            other => Err(MessageError::InvalidScope(other)),
        }
    }
}

/// Microseconds since the Unix epoch, the timestamp unit of the envelope
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// One fully-encoded outbound message plus its recipient-filtering metadata.
///
/// Created once per outbound send and shared read-only across every
/// connection it fans out to; an empty filter means broadcast.
#[derive(Debug)]
pub struct SerializedMessage {
    payload: Bytes,
    recipient_filter: Vec<NodeId>,
}

impl SerializedMessage {
    pub fn new(payload: Bytes, recipient_filter: Vec<NodeId>) -> Arc<Self> {
        Arc::new(Self {
            payload,
            recipient_filter,
        })
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Empty means broadcast to all connections
    pub fn recipient_filter(&self) -> &[NodeId] {
        &self.recipient_filter
    }
}

/// The decoded representation of one inbound message.
///
/// Envelope fields are parsed eagerly when the frame arrives; the body is
/// kept as opaque bytes for the bus-side deserializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeserializedMessage {
    /// Fully-qualified message type name, resolved by the bus
    pub type_name: String,
    /// Address of the sending node
    pub sender: NodeId,
    /// Explicit recipient addresses (empty for broadcast), at most 1024
    pub recipients: Vec<NodeId>,
    /// Delivery scope
    pub scope: Scope,
    /// Send timestamp, microseconds since the Unix epoch
    pub time_sent: u64,
    /// Expiration timestamp, microseconds since the Unix epoch
    pub expiration: u64,
    /// Name/value annotations, at most 128
    pub annotations: HashMap<String, String>,
    /// Opaque serialized message body
    pub body: Bytes,
}

impl DeserializedMessage {
    /// Encode the envelope and body into one frame payload.
    ///
    /// The bounds checked by `decode` are enforced symmetrically so an
    /// encoded message is always decodable.
    pub fn encode(&self) -> MessageResult<Bytes> {
        if self.recipients.len() > MAX_RECIPIENTS {
            return Err(MessageError::TooManyRecipients(self.recipients.len()));
        }
        if self.annotations.len() > MAX_ANNOTATIONS {
            return Err(MessageError::TooManyAnnotations(self.annotations.len()));
        }

        let mut buf = BytesMut::with_capacity(64 + self.body.len());
        put_string(&mut buf, &self.type_name);
        buf.put_slice(self.sender.as_bytes());

        buf.put_u32(self.recipients.len() as u32);
        for recipient in &self.recipients {
            buf.put_slice(recipient.as_bytes());
        }

        buf.put_u8(self.scope as u8);
        buf.put_u64(self.time_sent);
        buf.put_u64(self.expiration);

        buf.put_u32(self.annotations.len() as u32);
        for (key, value) in &self.annotations {
            put_string(&mut buf, key);
            put_string(&mut buf, value);
        }

        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Decode one frame payload, parsing the envelope eagerly.
    ///
    /// Any header field outside its bound (recipient count, annotation
    /// count, scope ordinal) or a truncated buffer invalidates the whole
    /// frame.
    pub fn decode(payload: Bytes) -> MessageResult<Self> {
        let mut buf = payload;

        let type_name = get_string(&mut buf)?;
        let sender = get_node_id(&mut buf)?;

        if buf.remaining() < 4 {
            return Err(MessageError::Truncated);
        }
        let recipient_count = buf.get_u32() as usize;
        if recipient_count > MAX_RECIPIENTS {
            return Err(MessageError::TooManyRecipients(recipient_count));
        }
        let mut recipients = Vec::with_capacity(recipient_count);
        for _ in 0..recipient_count {
            recipients.push(get_node_id(&mut buf)?);
        }

        if buf.remaining() < 1 + 8 + 8 {
            return Err(MessageError::Truncated);
        }
        let scope = Scope::from_u8(buf.get_u8())?;
        let time_sent = buf.get_u64();
        let expiration = buf.get_u64();

        if buf.remaining() < 4 {
            return Err(MessageError::Truncated);
        }
        let annotation_count = buf.get_u32() as usize;
        if annotation_count > MAX_ANNOTATIONS {
            return Err(MessageError::TooManyAnnotations(annotation_count));
        }
        let mut annotations = HashMap::with_capacity(annotation_count);
        for _ in 0..annotation_count {
            let key = get_string(&mut buf)?;
            let value = get_string(&mut buf)?;
            annotations.insert(key, value);
        }

        Ok(Self {
            type_name,
            sender,
            recipients,
            scope,
            time_sent,
            expiration,
            annotations,
            body: buf,
        })
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut Bytes) -> MessageResult<String> {
    if buf.remaining() < 4 {
        return Err(MessageError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(MessageError::Truncated);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| MessageError::InvalidUtf8)
}

fn get_node_id(buf: &mut Bytes) -> MessageResult<NodeId> {
    if buf.remaining() < 16 {
        return Err(MessageError::Truncated);
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(NodeId::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> DeserializedMessage {
        let mut annotations = HashMap::new();
        annotations.insert("origin".to_string(), "editor".to_string());

        DeserializedMessage {
            type_name: "engine.SessionServicePing".to_string(),
            sender: NodeId::generate(),
            recipients: vec![NodeId::generate(), NodeId::generate()],
            scope: Scope::Network,
            time_sent: now_micros(),
            expiration: now_micros() + 5_000_000,
            annotations,
            body: Bytes::from_static(b"opaque payload bytes"),
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let original = sample_message();
        let encoded = original.encode().unwrap();
        let decoded = DeserializedMessage::decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_recipient_bound_inclusive() {
        let mut message = sample_message();
        message.recipients = (0..MAX_RECIPIENTS).map(|_| NodeId::generate()).collect();

        let encoded = message.encode().unwrap();
        let decoded = DeserializedMessage::decode(encoded).unwrap();
        assert_eq!(decoded.recipients.len(), MAX_RECIPIENTS);
    }

    #[test]
    fn test_recipient_count_over_bound_rejected() {
        // Forge a raw envelope claiming 1025 recipients
        let mut buf = BytesMut::new();
        put_string(&mut buf, "forged");
        buf.put_slice(NodeId::generate().as_bytes());
        buf.put_u32((MAX_RECIPIENTS + 1) as u32);

        let err = DeserializedMessage::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, MessageError::TooManyRecipients(n) if n == MAX_RECIPIENTS + 1));
    }

    #[test]
    fn test_annotation_count_over_bound_rejected() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "forged");
        buf.put_slice(NodeId::generate().as_bytes());
        buf.put_u32(0); // no recipients
        buf.put_u8(Scope::Process as u8);
        buf.put_u64(0);
        buf.put_u64(0);
        buf.put_u32((MAX_ANNOTATIONS + 1) as u32);

        let err = DeserializedMessage::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, MessageError::TooManyAnnotations(n) if n == MAX_ANNOTATIONS + 1));
    }

    #[test]
    fn test_scope_over_max_rejected() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "forged");
        buf.put_slice(NodeId::generate().as_bytes());
        buf.put_u32(0);
        buf.put_u8(Scope::MAX + 1);
        buf.put_u64(0);
        buf.put_u64(0);

        let err = DeserializedMessage::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, MessageError::InvalidScope(_)));
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let encoded = sample_message().encode().unwrap();

        // Cut inside the type name string, then inside the sender id
        for cut in [8, 35] {
            let truncated = encoded.slice(..cut);
            assert!(matches!(
                DeserializedMessage::decode(truncated),
                Err(MessageError::Truncated)
            ));
        }
    }

    #[test]
    fn test_empty_body_roundtrip() {
        let mut message = sample_message();
        message.body = Bytes::new();

        let decoded = DeserializedMessage::decode(message.encode().unwrap()).unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_serialized_message_is_shared() {
        let message = SerializedMessage::new(Bytes::from_static(b"abc"), Vec::new());
        let clone = Arc::clone(&message);
        assert_eq!(clone.payload(), message.payload());
        assert!(message.recipient_filter().is_empty());
    }

    #[test]
    fn test_opaque_body_survives_transit() {
        // Body encoding is external; bincode stands in for the bus serializer
        let body: Vec<u8> = bincode::serialize(&(42u32, "ping".to_string())).unwrap();
        let mut message = sample_message();
        message.body = Bytes::from(body.clone());

        let decoded = DeserializedMessage::decode(message.encode().unwrap()).unwrap();
        let (num, text): (u32, String) = bincode::deserialize(&decoded.body).unwrap();
        assert_eq!(num, 42);
        assert_eq!(text, "ping");
    }
}
