//! Codecs for Parley envelopes.
//!
//! Two encodings are used:
//!
//! - **JSON** text frames between clients and a node.
//! - **MessagePack** with a length prefix between nodes over the bus.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum bus frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an envelope for the bus.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded envelope
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an envelope for the bus into an existing buffer.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(envelope)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode an envelope received from the bus.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let envelope = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(envelope)
}

/// Encode an envelope as a client JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a client JSON frame, enforcing the per-connection size limit.
///
/// # Errors
///
/// Returns an error if the frame exceeds `max_size` or is not a valid envelope.
pub fn decode_json(data: &[u8], max_size: usize) -> Result<Envelope, ProtocolError> {
    if data.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: max_size,
        });
    }
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Contact, GroupMessage};

    #[test]
    fn test_bus_roundtrip() {
        let envelopes = vec![
            Envelope::private_chat("alice", "bob", "hi"),
            Envelope::GroupChatBot(GroupMessage {
                message_id: 42,
                group: "rustaceans".into(),
                sender: "ChatBot".into(),
                recipient: "carol".into(),
                content: "answer".into(),
                created_at: 1_700_000_000_000,
            }),
            Envelope::presence(
                Contact {
                    id: "u-1".into(),
                    username: "alice".into(),
                    email: "alice@example.com".into(),
                },
                false,
                "bob",
                7,
            ),
        ];

        for envelope in envelopes {
            let encoded = encode(&envelope).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(envelope, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&Envelope::private_chat("a", "b", "c")).unwrap();

        match decode(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(&[0xc1, 0xc1, 0xc1]);
        assert!(matches!(decode(&buf), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_json_size_limit() {
        let raw = br#"{"type":"private_chat","recipient":"bob","content":"hello there"}"#;
        assert!(decode_json(raw, 1024).is_ok());

        match decode_json(raw, 16) {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                assert_eq!(size, raw.len());
                assert_eq!(max, 16);
            }
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_json_invalid() {
        assert!(matches!(
            decode_json(b"not json", 1024),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_json_tag_on_wire() {
        let text = encode_json(&Envelope::private_chat_bot("alice", "tell me a joke")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "private_chat_bot");
        assert_eq!(value["content"], "tell me a joke");
    }
}
