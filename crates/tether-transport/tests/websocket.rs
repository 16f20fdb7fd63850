//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener on a loopback port and connect a
//! `tokio-tungstenite` client to it.

#[cfg(feature = "websocket")]
mod websocket {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tether_transport::{Frame, Socket, Transport, WebSocketTransport};
    use tokio::io::AsyncReadExt;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    type ClientWs = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn bind() -> (WebSocketTransport, String) {
        let transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr").to_string();
        (transport, addr)
    }

    async fn connect_client(url: &str) -> ClientWs {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("client should connect");
        ws
    }

    #[tokio::test]
    async fn test_websocket_accept_and_exchange_frames() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });

        let mut client = connect_client(&format!("ws://{addr}")).await;
        let (socket, info) = server.await.expect("task should complete");

        assert!(socket.is_open());
        assert_eq!(info.remote_addr, socket.remote_addr());
        assert!(info.query.is_empty());

        // client → server, text
        client
            .send(Message::Text("[\"hello\",[]]".into()))
            .await
            .expect("client send");
        let frame = socket.recv().await.expect("recv").expect("frame");
        assert_eq!(frame, Frame::Text("[\"hello\",[]]".into()));

        // server → client, binary
        socket
            .send(Frame::Binary(vec![1, 2, 3]))
            .await
            .expect("server send");
        let msg = client.next().await.expect("message").expect("ok");
        assert_eq!(msg.into_data().to_vec(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_websocket_captures_query_string() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });

        let _client =
            connect_client(&format!("ws://{addr}/?previousConnectionId=abc123&mode=x")).await;
        let (_socket, info) = server.await.expect("task should complete");

        assert_eq!(info.param("previousConnectionId"), Some("abc123"));
        assert_eq!(info.param("mode"), Some("x"));
    }

    #[tokio::test]
    async fn test_websocket_close_sends_application_code() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });

        let mut client = connect_client(&format!("ws://{addr}")).await;
        let (socket, _info) = server.await.expect("task should complete");

        socket.close(4001, "unknown connection").await.expect("close");
        assert!(!socket.is_open());
        // A second close is a no-op.
        socket.close(4002, "again").await.expect("second close");

        match client.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::from(4001));
                assert_eq!(frame.reason.as_str(), "unknown connection");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_after_client_close() {
        let (mut transport, addr) = bind().await;
        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });

        let mut client = connect_client(&format!("ws://{addr}")).await;
        let (socket, _info) = server.await.expect("task should complete");

        client.close(None).await.expect("client close");

        let result = socket.recv().await.expect("recv should not error");
        assert_eq!(result, None);
        assert!(!socket.is_open());
    }

    #[tokio::test]
    async fn test_websocket_idle_peer_does_not_block_next_client() {
        let (mut transport, addr) = bind().await;
        // Connects over TCP but never sends an upgrade request.
        let _idle = tokio::net::TcpStream::connect(&addr).await.expect("tcp connect");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let server = tokio::spawn(async move { transport.accept().await.expect("should accept") });
        let client = tokio::time::timeout(
            Duration::from_secs(2),
            connect_client(&format!("ws://{addr}/?previousConnectionId=second")),
        )
        .await
        .expect("second client stuck behind an idle peer");

        let (_socket, info) = server.await.expect("task should complete");
        assert_eq!(info.param("previousConnectionId"), Some("second"));
        drop(client);
    }

    #[tokio::test]
    async fn test_websocket_handshake_timeout_drops_idle_peer() {
        let transport = WebSocketTransport::bind_with_timeout("127.0.0.1:0", Duration::from_millis(100))
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr");

        let mut idle = tokio::net::TcpStream::connect(addr).await.expect("tcp connect");
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), idle.read(&mut buf))
            .await
            .expect("idle peer was never dropped");
        // EOF or reset, either way the server let go.
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
