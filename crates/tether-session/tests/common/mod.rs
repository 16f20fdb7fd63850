//! Helpers shared by the session integration tests.

#![allow(dead_code)]

use std::time::Duration;

use tether_protocol::{
    AUTHENTICATE, AUTHENTICATION, Arg, AuthenticateRequest, AuthenticationSignal, Codec, Factor,
    JsonCodec, Message,
};
use tether_transport::memory::MemoryClient;

const WAIT: Duration = Duration::from_secs(1);

/// Waits for the next message the server sent to `client`.
pub async fn next_message(client: &MemoryClient) -> Message {
    let frame = tokio::time::timeout(WAIT, client.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed before a frame arrived");
    JsonCodec.decode_frame(&frame).expect("server sent a malformed frame")
}

/// Waits for the next `authentication` signal.
pub async fn next_signal(client: &MemoryClient) -> AuthenticationSignal {
    let message = next_message(client).await;
    assert_eq!(message.name, AUTHENTICATION);
    message.body[0].parse().expect("malformed authentication signal")
}

/// Sends `[name, body]` from the client.
pub async fn send(client: &MemoryClient, name: &str, body: Vec<Arg>) {
    let frame = JsonCodec
        .encode_frame(&Message::new(name, body), false)
        .unwrap();
    client.send(frame).await.unwrap();
}

/// Answers the passport ask.
pub async fn send_passport(client: &MemoryClient, input: &str) {
    let request = AuthenticateRequest {
        factor: Factor::Passport,
        passport_input: input.to_string(),
    };
    send(client, AUTHENTICATE, vec![Arg::json(&request).unwrap()]).await;
}

/// Reads until the server closes the socket and returns its close code.
pub async fn closed_with(client: &MemoryClient) -> Option<u16> {
    tokio::time::timeout(WAIT, async {
        while client.recv().await.is_some() {}
    })
    .await
    .expect("socket was not closed");
    client.close_code().await
}

/// Polls `check` until it holds, failing after a second.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
