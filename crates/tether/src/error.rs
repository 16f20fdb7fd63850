//! Unified error type for the Tether server.

use tether_activity::ActivityError;
use tether_protocol::ProtocolError;
use tether_session::SessionError;
use tether_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` conversions let `?` lift any layer's error into this one.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Authentication, reconnection, or settings.
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Activity(#[from] ActivityError),

    /// Socket-level failure outside the transport, such as reading the
    /// listener address.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
