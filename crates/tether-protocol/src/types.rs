//! Core protocol types for Tether's wire format.
//!
//! Every frame on the wire is a JSON array of exactly two elements:
//!
//! ```text
//! [ "name", [ arg0, arg1, ... ] ]
//! ```
//!
//! `name` addresses an event on the receiving side; the body is an ordered
//! list of arguments. An argument is either an arbitrary JSON value or a
//! raw byte buffer. Byte buffers have no native JSON representation, so
//! they travel tagged:
//!
//! ```text
//! [ "__bytes__", [ 104, 105 ] ]
//! ```
//!
//! This inflates binary payloads roughly three to four times, which is
//! accepted in exchange for running over text frames unchanged.

use std::fmt;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::ProtocolError;

/// Tag marking a byte-buffer argument on the wire.
pub const BYTES_TAG: &str = "__bytes__";

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Generates a random 32-character hex string (128 bits of entropy).
///
/// Ids double as reconnection credentials for connections, so they must
/// not be guessable.
fn random_hex_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

/// Identifies a client connection. Stable across reconnection.
///
/// `#[serde(transparent)]` keeps it a plain string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(random_hex_id())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one activity (a plugin session) on a connection.
///
/// Independent of the connection id; also used as the event-name prefix
/// that isolates one activity's traffic from another's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityId(String);

impl ActivityId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(random_hex_id())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActivityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ActivityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Arg: one element of a message body
// ---------------------------------------------------------------------------

/// One element of a message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Any JSON value.
    Value(Value),
    /// A raw byte buffer, tagged as `["__bytes__", [...]]` on the wire.
    Bytes(Vec<u8>),
}

impl Arg {
    /// Serializes any value into a JSON argument.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, ProtocolError> {
        serde_json::to_value(value)
            .map(Self::Value)
            .map_err(ProtocolError::Encode)
    }

    /// Deserializes a JSON argument into `T`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidMessage`] for byte buffers and
    /// [`ProtocolError::Decode`] when the value doesn't fit `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        match self {
            Self::Value(value) => {
                T::deserialize(value).map_err(ProtocolError::Decode)
            }
            Self::Bytes(_) => Err(ProtocolError::InvalidMessage(
                "expected a JSON value, got bytes".into(),
            )),
        }
    }

    /// Returns the bytes if this is a byte-buffer argument.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Value(_) => None,
        }
    }

    /// Returns the JSON value if this is a JSON argument.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Bytes(_) => None,
        }
    }

    /// Reconstructs an argument from its decoded JSON form.
    ///
    /// A two-element array whose first element is the bytes tag and whose
    /// second element is an array of integers in `0..=255` becomes
    /// [`Arg::Bytes`]. Anything else, including a tagged array with a
    /// malformed payload, stays a plain value.
    fn from_wire(value: Value) -> Self {
        if let Value::Array(items) = &value {
            if let [Value::String(tag), Value::Array(raw)] = items.as_slice() {
                if tag == BYTES_TAG {
                    let bytes: Option<Vec<u8>> = raw
                        .iter()
                        .map(|n| n.as_u64().and_then(|n| u8::try_from(n).ok()))
                        .collect();
                    if let Some(bytes) = bytes {
                        return Self::Bytes(bytes);
                    }
                }
            }
        }
        Self::Value(value)
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for Arg {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<&str> for Arg {
    fn from(text: &str) -> Self {
        Self::Value(Value::String(text.to_string()))
    }
}

impl From<String> for Arg {
    fn from(text: String) -> Self {
        Self::Value(Value::String(text))
    }
}

impl Serialize for Arg {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(value) => value.serialize(serializer),
            // `Vec<u8>` serializes as a JSON array of numbers.
            Self::Bytes(bytes) => (BYTES_TAG, bytes).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Arg {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_wire)
    }
}

// ---------------------------------------------------------------------------
// Message: the top-level wire frame
// ---------------------------------------------------------------------------

/// A named message with its ordered body: `[name, body]` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Event name the receiver dispatches on.
    pub name: String,
    /// Ordered arguments.
    pub body: Vec<Arg>,
}

impl Message {
    /// Creates a message.
    pub fn new(name: impl Into<String>, body: Vec<Arg>) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.name, &self.body).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // A 2-tuple only accepts a JSON array of exactly two elements, so
        // anything other than `[string, array]` fails here.
        let (name, body) = <(String, Vec<Arg>)>::deserialize(deserializer)?;
        Ok(Self { name, body })
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip_bytes(bytes: Vec<u8>) {
        let arg = Arg::Bytes(bytes.clone());
        let encoded = serde_json::to_string(&arg).unwrap();
        let decoded: Arg = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), Some(bytes.as_slice()));
    }

    // =====================================================================
    // Ids
    // =====================================================================

    #[test]
    fn test_connection_id_generate_is_32_hex_chars() {
        let id = ConnectionId::generate();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
        assert_ne!(ActivityId::generate(), ActivityId::generate());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&ActivityId::from("a1")).unwrap();
        assert_eq!(json, "\"a1\"");
        let id: ConnectionId = serde_json::from_str("\"c1\"").unwrap();
        assert_eq!(id, ConnectionId::from("c1"));
        assert_eq!(id.to_string(), "c1");
    }

    // =====================================================================
    // Arg
    // =====================================================================

    #[test]
    fn test_bytes_encode_as_tagged_pair() {
        let json = serde_json::to_value(Arg::Bytes(vec![104, 105])).unwrap();
        assert_eq!(json, json!(["__bytes__", [104, 105]]));
    }

    #[test]
    fn test_bytes_round_trip_empty() {
        round_trip_bytes(Vec::new());
    }

    #[test]
    fn test_bytes_round_trip_single_byte() {
        round_trip_bytes(vec![255]);
    }

    #[test]
    fn test_bytes_round_trip_ten_thousand_bytes() {
        round_trip_bytes((0..10_000u32).map(|i| (i % 256) as u8).collect());
    }

    #[test]
    fn test_tag_with_out_of_range_numbers_stays_a_value() {
        let arg: Arg = serde_json::from_value(json!(["__bytes__", [1, 256]])).unwrap();
        assert!(arg.as_bytes().is_none());
        assert_eq!(arg.as_value(), Some(&json!(["__bytes__", [1, 256]])));
    }

    #[test]
    fn test_plain_values_pass_through() {
        let arg: Arg = serde_json::from_value(json!({"a": [1, 2]})).unwrap();
        assert_eq!(arg, Arg::Value(json!({"a": [1, 2]})));
    }

    #[test]
    fn test_parse_rejects_bytes() {
        let arg = Arg::Bytes(vec![1]);
        let result: Result<u32, _> = arg.parse();
        assert!(matches!(result, Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn test_json_then_parse_struct() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Point {
            x: i32,
        }
        let arg = Arg::json(&Point { x: 3 }).unwrap();
        assert_eq!(arg.parse::<Point>().unwrap(), Point { x: 3 });
    }

    // =====================================================================
    // Message
    // =====================================================================

    #[test]
    fn test_message_serializes_as_name_body_pair() {
        let msg = Message::new("ping", vec![Arg::from("a"), Arg::Bytes(vec![7])]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, json!(["ping", ["a", ["__bytes__", [7]]]]));
    }

    #[test]
    fn test_message_decodes_mixed_body() {
        let msg: Message =
            serde_json::from_str(r#"["x", [1, ["__bytes__", [0, 1]], null]]"#).unwrap();
        assert_eq!(msg.name, "x");
        assert_eq!(msg.body[0], Arg::Value(json!(1)));
        assert_eq!(msg.body[1], Arg::Bytes(vec![0, 1]));
        assert_eq!(msg.body[2], Arg::Value(Value::Null));
    }

    #[test]
    fn test_message_rejects_non_string_name() {
        assert!(serde_json::from_str::<Message>(r#"[1, []]"#).is_err());
    }

    #[test]
    fn test_message_rejects_non_array_body() {
        assert!(serde_json::from_str::<Message>(r#"["x", {}]"#).is_err());
    }

    #[test]
    fn test_message_rejects_wrong_arity() {
        assert!(serde_json::from_str::<Message>(r#"["x"]"#).is_err());
        assert!(serde_json::from_str::<Message>(r#"["x", [], 1]"#).is_err());
        assert!(serde_json::from_str::<Message>(r#"{"name": "x"}"#).is_err());
    }
}
