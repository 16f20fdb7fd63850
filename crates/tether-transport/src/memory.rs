//! In-process socket pair.
//!
//! [`pair`] returns a server-side [`MemorySocket`] (implements [`Socket`])
//! and a [`MemoryClient`] that plays the remote peer. Frames travel over
//! unbounded Tokio channels, so nothing here touches the network.
//!
//! Either side can close:
//! - [`Socket::close`] on the server side records the close code (readable
//!   through [`MemoryClient::close_code`]) and ends both directions.
//! - [`MemoryClient::close`] simulates the client dropping the connection;
//!   the server's next `recv` returns `Ok(None)`.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc, watch};

use crate::{Frame, Socket, TransportError};

/// State shared by both ends of a pair.
#[derive(Debug)]
struct Shared {
    open: AtomicBool,
    close_code: Mutex<Option<u16>>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
    }
}

/// Server end of an in-process socket pair.
#[derive(Debug)]
pub struct MemorySocket {
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    closed_rx: watch::Receiver<bool>,
    remote_addr: Option<IpAddr>,
}

/// Client end of an in-process socket pair.
#[derive(Debug)]
pub struct MemoryClient {
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

/// Creates a connected socket pair.
pub fn pair(remote_addr: Option<IpAddr>) -> (MemorySocket, MemoryClient) {
    let (to_client, from_server) = mpsc::unbounded_channel();
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);

    let shared = Arc::new(Shared {
        open: AtomicBool::new(true),
        close_code: Mutex::new(None),
        closed_tx,
    });

    let socket = MemorySocket {
        shared: Arc::clone(&shared),
        outbound: Mutex::new(Some(to_client)),
        inbound: Mutex::new(from_client),
        closed_rx,
        remote_addr,
    };
    let client = MemoryClient {
        shared,
        outbound: Mutex::new(Some(to_server)),
        inbound: Mutex::new(from_server),
    };
    (socket, client)
}

impl Socket for MemorySocket {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed("socket closed".into()));
        }
        let outbound = self.outbound.lock().await;
        let sender = outbound
            .as_ref()
            .ok_or_else(|| TransportError::Closed("socket closed".into()))?;
        sender
            .send(frame)
            .map_err(|_| TransportError::Closed("peer went away".into()))
    }

    async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        let mut closed = self.closed_rx.clone();
        tokio::select! {
            frame = inbound.recv() => {
                if frame.is_none() {
                    self.shared.mark_closed();
                }
                Ok(frame)
            }
            _ = closed.wait_for(|closed| *closed) => Ok(None),
        }
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }
        tracing::trace!(code, reason, "closing memory socket");
        *self.shared.close_code.lock().await = Some(code);
        self.shared.mark_closed();
        // Dropping the sender lets the client drain what was already sent
        // and then observe the end of the stream.
        self.outbound.lock().await.take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }
}

impl MemoryClient {
    /// Sends a frame to the server side.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().await;
        let sender = outbound
            .as_ref()
            .ok_or_else(|| TransportError::Closed("client closed".into()))?;
        sender
            .send(frame)
            .map_err(|_| TransportError::Closed("server went away".into()))
    }

    /// Sends a text frame.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::Text(text.into())).await
    }

    /// Receives the next frame sent by the server.
    ///
    /// Returns `None` once the server closed the socket and every frame
    /// sent before the close has been read.
    pub async fn recv(&self) -> Option<Frame> {
        self.inbound.lock().await.recv().await
    }

    /// Returns a frame if one is already queued, without waiting.
    pub async fn try_recv(&self) -> Option<Frame> {
        self.inbound.lock().await.try_recv().ok()
    }

    /// Simulates the client dropping the connection.
    pub async fn close(&self) {
        self.outbound.lock().await.take();
        self.shared.mark_closed();
    }

    /// Returns the close code the server closed the socket with, if any.
    pub async fn close_code(&self) -> Option<u16> {
        *self.shared.close_code.lock().await
    }

    /// Returns `true` until either side closed the pair.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}
