//! WebSocket transport implementation using `tokio-tungstenite`.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::{ConnectInfo, Frame, Socket, Transport, TransportError};

type WsStream = WebSocketStream<TcpStream>;

/// How long a TCP peer gets to complete the WebSocket upgrade.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long sending the close frame may take before the socket is given up.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upgraded sockets waiting for [`Transport::accept`].
const ACCEPT_QUEUE_SIZE: usize = 64;

/// A WebSocket-based [`Transport`] that listens for incoming connections.
///
/// ```text
///  TcpListener ──accept──→ spawn(handshake, timeout) ──→ queue ──→ accept()
/// ```
///
/// Each upgrade runs on its own task, so a peer that never finishes its
/// handshake holds up nobody else.
pub struct WebSocketTransport {
    local_addr: SocketAddr,
    upgraded: mpsc::Receiver<(WebSocketSocket, ConnectInfo)>,
    listener: JoinHandle<()>,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        Self::bind_with_timeout(addr, DEFAULT_HANDSHAKE_TIMEOUT).await
    }

    /// Like [`bind`](Self::bind), with a custom upgrade deadline.
    pub async fn bind_with_timeout(
        addr: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        tracing::info!(%local_addr, "WebSocket transport listening");

        let (tx, upgraded) = mpsc::channel(ACCEPT_QUEUE_SIZE);
        let listener = tokio::spawn(listen(listener, tx, handshake_timeout));
        Ok(Self {
            local_addr,
            upgraded,
            listener,
        })
    }

    /// Returns the address the listener is bound to.
    ///
    /// Useful after binding to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(
    listener: TcpListener,
    upgraded: mpsc::Sender<(WebSocketSocket, ConnectInfo)>,
    handshake_timeout: Duration,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "TCP accept failed");
                // Usually out of file descriptors; don't spin.
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        if upgraded.is_closed() {
            break;
        }

        let upgraded = upgraded.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(handshake_timeout, upgrade(stream, addr)).await {
                Ok(Ok(socket)) => {
                    let _ = upgraded.send(socket).await;
                }
                Ok(Err(e)) => tracing::debug!(%addr, error = %e, "handshake failed"),
                Err(_) => tracing::debug!(%addr, "handshake timed out"),
            }
        });
    }
}

async fn upgrade(
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(WebSocketSocket, ConnectInfo), TransportError> {
    // The reconnection id travels in the upgrade request's query
    // string, so capture it during the handshake.
    let mut query = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        query = request.uri().query().map(str::to_owned);
        Ok::<_, ErrorResponse>(response)
    })
    .await
    .map_err(|e| TransportError::Handshake(format!("{addr}: {e}")))?;

    let info = ConnectInfo::from_query(Some(addr.ip()), query.as_deref());
    tracing::debug!(%addr, "accepted WebSocket connection");

    let (sink, stream) = ws.split();
    Ok((
        WebSocketSocket {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
            remote_addr: addr.ip(),
        },
        info,
    ))
}

impl Transport for WebSocketTransport {
    type Socket = WebSocketSocket;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<(Self::Socket, ConnectInfo), Self::Error> {
        self.upgraded
            .recv()
            .await
            .ok_or_else(|| TransportError::Closed("listener stopped".into()))
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        self.listener.abort();
        Ok(())
    }
}

/// A single WebSocket connection.
///
/// The stream is split so a pending `recv` never blocks a `send`.
pub struct WebSocketSocket {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    open: AtomicBool,
    remote_addr: IpAddr,
}

fn broken_pipe(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::Send(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
}

impl Socket for WebSocketSocket {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed("socket closed".into()));
        }
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
        };
        self.sink.lock().await.send(msg).await.map_err(broken_pipe)
    }

    async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        loop {
            let msg = self.stream.lock().await.next().await;
            match msg {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Frame::Binary(data.into())));
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Ok(_)) => continue, // skip ping/pong/frame
                Some(Err(e)) => {
                    self.open.store(false, Ordering::SeqCst);
                    return Err(TransportError::Receive(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        let send = async { self.sink.lock().await.send(Message::Close(Some(frame))).await };
        match tokio::time::timeout(CLOSE_TIMEOUT, send).await {
            Ok(result) => result.map_err(broken_pipe),
            Err(_) => Err(TransportError::Send(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "close frame not accepted",
            ))),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        Some(self.remote_addr)
    }
}
