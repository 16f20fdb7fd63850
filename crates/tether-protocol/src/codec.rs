//! Codec trait and the JSON implementation.
//!
//! A codec converts between Rust types and raw bytes. The session layer
//! only needs something implementing [`Codec`]; [`JsonCodec`] is the one
//! the wire format is defined in. On top of the generic `encode`/`decode`
//! pair, [`Codec::encode_frame`] and [`Codec::decode_frame`] move a
//! [`Message`] in and out of a transport [`Frame`].

use serde::{Serialize, de::DeserializeOwned};
use tether_transport::Frame;

use crate::{Message, ProtocolError};

/// A codec that can encode Rust types to bytes and decode bytes back.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;

    /// Encodes a message into a text frame, or a binary frame when
    /// `binary` is set. Both carry the same document.
    fn encode_frame(&self, message: &Message, binary: bool) -> Result<Frame, ProtocolError> {
        let bytes = self.encode(message)?;
        if binary {
            return Ok(Frame::Binary(bytes));
        }
        String::from_utf8(bytes)
            .map(Frame::Text)
            .map_err(|e| ProtocolError::InvalidMessage(format!("encoded frame is not UTF-8: {e}")))
    }

    /// Decodes a frame of either type into a message.
    fn decode_frame(&self, frame: &Frame) -> Result<Message, ProtocolError> {
        self.decode(frame.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ## Example
///
/// ```rust
/// use tether_protocol::{Arg, Codec, JsonCodec, Message};
///
/// let codec = JsonCodec;
/// let message = Message::new("ping", vec![Arg::Bytes(vec![1, 2])]);
///
/// let frame = codec.encode_frame(&message, false).unwrap();
/// let decoded = codec.decode_frame(&frame).unwrap();
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
