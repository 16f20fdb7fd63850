/// Errors raised by a transport or one of its sockets.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The socket is closed; nothing more can be sent on it.
    #[error("socket closed: {0}")]
    Closed(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The TCP accept itself failed.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// A TCP peer connected but never completed the WebSocket upgrade.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] std::io::Error),
}
