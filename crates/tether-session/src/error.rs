//! Error types for the session layer.

use std::path::PathBuf;

use tether_protocol::{ConnectionId, Factor, ProtocolError};
use tether_transport::TransportError;

/// Errors that can occur while building, configuring, or using
/// connections.
///
/// Protocol violations by the remote client (malformed frames, stale
/// reconnect ids) are never reported through this type; they are answered
/// on the wire instead.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Every authentication factor would be optional.
    /// At least one factor must stay required at all times.
    #[error("at least one authentication factor must be required")]
    NoRequiredFactor,

    /// The passport factor is required but no credential verifier is
    /// configured.
    #[error("passport factor is required but no passport is configured")]
    PassportUnavailable,

    /// An operation targeted a factor that this connection doesn't require.
    #[error("authentication factor {0} is not required")]
    FactorNotRequired(Factor),

    /// A persisted passport record uses a hash type we can't verify.
    #[error("unsupported passport type {0:?}")]
    UnsupportedPassport(String),

    /// Sending while the connection has no open socket.
    #[error("connection {0} is disconnected")]
    Disconnected(ConnectionId),

    /// Sending before the connection finished authentication.
    #[error("connection {0} is not authenticated")]
    NotAuthenticated(ConnectionId),

    /// No reply arrived for a request within the configured timeout.
    #[error("no reply to {name:?} on connection {id}")]
    ReplyTimeout { id: ConnectionId, name: String },

    /// The pending reply was discarded before it arrived: the connection
    /// dropped, or a newer request with the same name replaced it.
    #[error("reply to {name:?} on connection {id} was discarded")]
    ReplyDropped { id: ConnectionId, name: String },

    /// Reading or writing the settings file failed.
    #[error("settings file {path}: {source}")]
    SettingsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settings file isn't valid JSON for the expected shape.
    #[error("settings file {path}: {source}")]
    SettingsFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A transport-level failure while sending.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
