//! Transport abstraction layer for Tether.
//!
//! Provides the [`Transport`] and [`Socket`] traits that abstract over the
//! full-duplex message transport a remote client talks to us through.
//! Everything above this crate only ever sees whole [`Frame`]s; how they
//! are carried (WebSocket, in-process channels) is decided here.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`
//!
//! The [`memory`] module is always available. It wires a server-side
//! [`Socket`] to a client handle through in-process channels, which is how
//! the session and activity crates drive their tests.

mod error;
pub mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{DEFAULT_HANDSHAKE_TIMEOUT, WebSocketSocket, WebSocketTransport};

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;

/// A single message as carried by the transport.
///
/// The session layer encodes the same JSON document into either variant;
/// the variant only tells the transport which frame type to put on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A UTF-8 text frame.
    Text(String),
    /// A binary frame.
    Binary(Vec<u8>),
}

impl Frame {
    /// Returns the frame payload as bytes regardless of frame type.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }

    /// Returns `true` for binary frames.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

/// What the transport learned about a client while accepting it.
///
/// The connection manager reads the reconnection id from `query`; the
/// address is informational.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Remote IP address, when the transport knows it.
    pub remote_addr: Option<IpAddr>,
    /// Query parameters of the upgrade request.
    pub query: HashMap<String, String>,
}

impl ConnectInfo {
    /// Builds a `ConnectInfo` from a raw, form-encoded query string such as
    /// `previousConnectionId=abc&foo=bar`.
    ///
    /// Keys and values are percent-decoded. Pairs without `=` are kept with
    /// an empty value. Later duplicates win.
    pub fn from_query(remote_addr: Option<IpAddr>, query: Option<&str>) -> Self {
        let query = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
            .into_owned()
            .collect();
        Self { remote_addr, query }
    }

    /// Returns the value of a query parameter, if present.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

/// Accepts new incoming sockets.
pub trait Transport: Send + Sync + 'static {
    /// The socket type produced by this transport.
    type Socket: Socket;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Waits for and accepts the next incoming socket.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<(Self::Socket, ConnectInfo), Self::Error>> + Send;

    /// Gracefully shuts down the transport, stopping new connections.
    fn shutdown(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// One full-duplex client socket.
///
/// Futures are declared `Send` so that generic code (the per-connection
/// reader task, the accept loop) can be spawned onto the Tokio runtime.
pub trait Socket: Send + Sync + 'static {
    /// Sends one frame to the remote peer.
    fn send(&self, frame: Frame) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next frame from the remote peer.
    ///
    /// Returns `Ok(None)` once the socket is closed, by either side.
    fn recv(&self) -> impl Future<Output = Result<Option<Frame>, TransportError>> + Send;

    /// Closes the socket with an application close code.
    ///
    /// Closing an already closed socket is a no-op.
    fn close(
        &self,
        code: u16,
        reason: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns `true` until the socket is closed by either side.
    fn is_open(&self) -> bool;

    /// Returns the remote IP address, when known.
    fn remote_addr(&self) -> Option<IpAddr>;
}
