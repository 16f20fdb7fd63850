//! Error types for the protocol layer.
//!
//! Each crate in Tether defines its own error enum. A `ProtocolError`
//! always means a frame or payload could not be turned into (or out of)
//! its wire shape; it never says anything about the socket itself.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into JSON).
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Deserialization failed (turning JSON into a Rust type).
    ///
    /// Common causes: malformed JSON, a frame that is not a
    /// `[name, body]` pair, or a payload missing required fields.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The message decoded but violates protocol rules, e.g. a body
    /// element that was expected to be a JSON value held raw bytes.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
