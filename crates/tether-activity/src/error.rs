//! Error types for the activity layer.

use tether_protocol::{ActivityId, ConnectionId};

/// Errors that can occur during activity operations.
///
/// The `Display` text of these is what a client sees in the `error` field
/// of a failed `newActivity` reply, so it stays short.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    /// No plugin is registered under this name.
    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),

    /// The connection has no open socket.
    #[error("connection {0} is disconnected")]
    NotConnected(ConnectionId),

    /// The connection hasn't finished authentication.
    #[error("connection {0} is not authenticated")]
    NotAuthenticated(ConnectionId),

    /// The request named no activity.
    #[error("missing activity id")]
    MissingId,

    /// The activity does not exist.
    #[error("activity {0} not found")]
    NotFound(ActivityId),

    /// The activity belongs to a different connection.
    #[error("activity {0} not found")]
    NotOwner(ActivityId),
}
