//! Integration tests for a single connection over in-memory sockets.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{closed_with, eventually, next_message, next_signal, send, send_passport};
use tether_protocol::{
    Arg, AuthStatus, AuthenticationSignal, BYTES_TAG, Codec, Factor, JsonCodec, close_code,
};
use tether_session::{
    Connection, ConnectionEvent, ConnectionOptions, FactorConfig, Passport, SaltedPassport,
    SessionError,
};
use tether_transport::Frame;
use tether_transport::memory::{self, MemoryClient, MemorySocket};

// =========================================================================
// Helpers
// =========================================================================

fn with_passport(factors: FactorConfig, secret: &str) -> ConnectionOptions {
    let passport: Arc<dyn Passport> = Arc::new(SaltedPassport::generate(secret));
    ConnectionOptions {
        factors,
        passport: Some(passport),
        ..ConnectionOptions::default()
    }
}

fn both_factors() -> FactorConfig {
    FactorConfig {
        confirmation: true,
        passport: true,
    }
}

async fn started(options: ConnectionOptions) -> (Arc<Connection<MemorySocket>>, MemoryClient) {
    let (socket, client) = memory::pair(None);
    let connection = Connection::new(socket, options).unwrap();
    connection.start().await;
    (connection, client)
}

/// Closes the client side and waits until the connection noticed.
async fn drop_client(connection: &Connection<MemorySocket>, client: &MemoryClient) {
    let mut events = connection.events();
    client.close().await;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("connection never noticed the close")
            .unwrap();
        if event == ConnectionEvent::Disconnected {
            break;
        }
    }
}

/// A confirmation-only connection, already confirmed.
async fn authenticated() -> (Arc<Connection<MemorySocket>>, MemoryClient) {
    let (connection, client) = started(ConnectionOptions::default()).await;
    next_signal(&client).await; // ask
    connection.confirm(true).await.unwrap();
    next_signal(&client).await; // confirmation allow
    next_signal(&client).await; // aggregate allow
    (connection, client)
}

// =========================================================================
// Construction
// =========================================================================

#[test]
fn test_new_without_required_factor_fails() {
    let (socket, _client) = memory::pair(None);
    let options = ConnectionOptions {
        factors: FactorConfig {
            confirmation: false,
            passport: false,
        },
        ..ConnectionOptions::default()
    };
    assert!(matches!(
        Connection::new(socket, options),
        Err(SessionError::NoRequiredFactor)
    ));
}

#[test]
fn test_new_passport_without_verifier_fails() {
    let (socket, _client) = memory::pair(None);
    let options = ConnectionOptions {
        factors: both_factors(),
        ..ConnectionOptions::default()
    };
    assert!(matches!(
        Connection::new(socket, options),
        Err(SessionError::PassportUnavailable)
    ));
}

// =========================================================================
// Authentication
// =========================================================================

#[tokio::test]
async fn test_start_asks_first_required_factor() {
    let (connection, client) = started(ConnectionOptions::default()).await;

    let ask = next_signal(&client).await;
    assert_eq!(ask, AuthenticationSignal::ask(Factor::Confirmation, None));
    assert!(connection.is_connected());
    assert!(!connection.is_authenticated());
}

#[tokio::test]
async fn test_confirm_allow_authenticates_with_id() {
    let (connection, client) = started(ConnectionOptions::default()).await;
    let mut events = connection.events();
    next_signal(&client).await;

    connection.confirm(true).await.unwrap();

    let factor = next_signal(&client).await;
    assert_eq!(factor.factor, Some(Factor::Confirmation));
    assert_eq!(factor.status, AuthStatus::Allow);

    let aggregate = next_signal(&client).await;
    assert_eq!(aggregate.factor, None);
    assert_eq!(aggregate.status, AuthStatus::Allow);
    assert_eq!(aggregate.id.as_ref(), Some(connection.id()));
    assert!(connection.is_authenticated());

    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Authentication(s) if s.factor == Some(Factor::Confirmation)
    ));
}

#[tokio::test]
async fn test_confirm_deny_closes_with_unauthenticated() {
    let (connection, client) = started(ConnectionOptions::default()).await;
    next_signal(&client).await;

    connection.confirm(false).await.unwrap();

    assert_eq!(next_signal(&client).await.status, AuthStatus::Deny);
    let aggregate = next_signal(&client).await;
    assert!(aggregate.is_aggregate_deny());
    assert_eq!(aggregate.id, None);
    assert_eq!(closed_with(&client).await, Some(close_code::UNAUTHENTICATED));
    eventually(|| !connection.is_connected()).await;
}

#[tokio::test]
async fn test_passport_ask_carries_credential_type() {
    let (_connection, client) = started(with_passport(both_factors(), "pw")).await;

    let ask = next_signal(&client).await;
    assert_eq!(ask.factor, Some(Factor::Passport));
    assert_eq!(ask.status, AuthStatus::Ask);
    assert_eq!(ask.kind.as_deref(), Some("sha256"));
}

#[tokio::test]
async fn test_wrong_passport_denies_and_closes() {
    let (connection, client) = started(with_passport(both_factors(), "pw")).await;
    next_signal(&client).await;

    send_passport(&client, "nope").await;

    let result = next_signal(&client).await;
    assert_eq!(result, AuthenticationSignal::factor_result(Factor::Passport, false));
    assert!(next_signal(&client).await.is_aggregate_deny());
    assert_eq!(closed_with(&client).await, Some(close_code::UNAUTHENTICATED));
    assert!(!connection.is_authenticated());
}

#[tokio::test]
async fn test_passport_success_then_confirmation_authenticates() {
    let (connection, client) = started(with_passport(both_factors(), "pw")).await;
    next_signal(&client).await;

    send_passport(&client, "pw").await;

    assert_eq!(
        next_signal(&client).await,
        AuthenticationSignal::factor_result(Factor::Passport, true)
    );
    // The confirmation ask follows; no aggregate in between.
    assert_eq!(
        next_signal(&client).await,
        AuthenticationSignal::ask(Factor::Confirmation, None)
    );
    assert!(!connection.is_authenticated());

    connection.confirm(true).await.unwrap();
    assert_eq!(
        next_signal(&client).await,
        AuthenticationSignal::factor_result(Factor::Confirmation, true)
    );
    let aggregate = next_signal(&client).await;
    assert_eq!(aggregate.status, AuthStatus::Allow);
    assert!(connection.is_authenticated());
}

#[tokio::test]
async fn test_passport_only_authenticates_immediately() {
    let factors = FactorConfig {
        confirmation: false,
        passport: true,
    };
    let (connection, client) = started(with_passport(factors, "pw")).await;
    next_signal(&client).await;

    send_passport(&client, "pw").await;

    assert_eq!(next_signal(&client).await.status, AuthStatus::Allow);
    let aggregate = next_signal(&client).await;
    assert_eq!(aggregate.factor, None);
    assert_eq!(aggregate.status, AuthStatus::Allow);
    assert!(connection.is_authenticated());
}

#[tokio::test]
async fn test_authenticate_after_passport_verified_is_ignored() {
    let (connection, client) = started(with_passport(both_factors(), "pw")).await;
    next_signal(&client).await;
    send_passport(&client, "pw").await;
    next_signal(&client).await; // passport allow
    next_signal(&client).await; // confirmation ask

    send_passport(&client, "wrong").await;
    // Sync point: the operator's decision is signalled after the ignored
    // attempt was processed.
    tokio::time::sleep(Duration::from_millis(20)).await;
    connection.confirm(true).await.unwrap();

    assert_eq!(
        next_signal(&client).await,
        AuthenticationSignal::factor_result(Factor::Confirmation, true)
    );
    assert_eq!(connection.factor(Factor::Passport).await.verified, Some(true));
}

#[tokio::test]
async fn test_confirm_when_not_required_fails() {
    let factors = FactorConfig {
        confirmation: false,
        passport: true,
    };
    let (connection, _client) = started(with_passport(factors, "pw")).await;
    assert!(matches!(
        connection.confirm(true).await,
        Err(SessionError::FactorNotRequired(Factor::Confirmation))
    ));
}

// =========================================================================
// Messaging
// =========================================================================

#[tokio::test]
async fn test_send_before_authentication_fails() {
    let (connection, _client) = started(ConnectionOptions::default()).await;
    let result = connection.send("chat", vec![Arg::from("hi")]).await;
    assert!(matches!(result, Err(SessionError::NotAuthenticated(_))));
}

#[tokio::test]
async fn test_send_after_disconnect_fails() {
    let (connection, client) = authenticated().await;
    client.close().await;
    eventually(|| !connection.is_connected()).await;

    let result = connection.send("chat", vec![Arg::from("hi")]).await;
    assert!(matches!(result, Err(SessionError::Disconnected(_))));
}

#[tokio::test]
async fn test_send_tags_byte_buffers() {
    let (connection, client) = authenticated().await;

    connection
        .send("blob", vec![Arg::Bytes(vec![1, 2, 3]), Arg::from("x")])
        .await
        .unwrap();

    let frame = client.recv().await.unwrap();
    let text = match &frame {
        Frame::Text(text) => text.clone(),
        Frame::Binary(_) => panic!("expected a text frame"),
    };
    assert!(text.contains(BYTES_TAG));
    let message = JsonCodec.decode_frame(&frame).unwrap();
    assert_eq!(message.body[0], Arg::Bytes(vec![1, 2, 3]));
}

#[tokio::test]
async fn test_send_binary_uses_binary_frame() {
    let (connection, client) = authenticated().await;
    connection
        .send_binary("blob", vec![Arg::from("x")])
        .await
        .unwrap();
    assert!(client.recv().await.unwrap().is_binary());
}

#[tokio::test]
async fn test_frames_before_authentication_are_discarded() {
    let (connection, client) = started(ConnectionOptions::default()).await;
    let mut chat = connection.subscribe("chat").await;
    next_signal(&client).await;

    send(&client, "chat", vec![Arg::from("early")]).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    connection.confirm(true).await.unwrap();
    send(&client, "chat", vec![Arg::from("late")]).await;

    let body = tokio::time::timeout(Duration::from_secs(1), chat.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body, vec![Arg::from("late")]);
}

#[tokio::test]
async fn test_malformed_frames_are_counted() {
    let (connection, client) = authenticated().await;

    client.send_text("not json").await.unwrap();
    client.send_text(r#"{"name":"x"}"#).await.unwrap();
    client.send_text(r#"["x", "not an array"]"#).await.unwrap();

    eventually(|| connection.dropped_frames() == 3).await;
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_request_resolves_with_reply_body() {
    let (connection, client) = authenticated().await;

    let requester = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.request("sum", vec![Arg::from("1+1")]).await })
    };

    let request = next_message(&client).await;
    assert_eq!(request.name, "sum");
    send(&client, "sum", vec![Arg::from("2")]).await;

    let reply = requester.await.unwrap().unwrap();
    assert_eq!(reply, vec![Arg::from("2")]);
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out_without_reply() {
    let options = ConnectionOptions {
        request_timeout: Duration::from_millis(50),
        ..ConnectionOptions::default()
    };
    let (connection, client) = started(options).await;
    next_signal(&client).await;
    connection.confirm(true).await.unwrap();

    let result = connection.request("sum", vec![]).await;
    assert!(matches!(result, Err(SessionError::ReplyTimeout { name, .. }) if name == "sum"));
}

#[tokio::test]
async fn test_request_dropped_when_connection_lost() {
    let (connection, client) = authenticated().await;

    let requester = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.request("sum", vec![]).await })
    };
    next_message(&client).await;
    client.close().await;

    let result = requester.await.unwrap();
    assert!(matches!(result, Err(SessionError::ReplyDropped { .. })));
}

// =========================================================================
// Socket lifecycle
// =========================================================================

#[tokio::test]
async fn test_client_close_emits_disconnected() {
    let (connection, client) = authenticated().await;

    drop_client(&connection, &client).await;

    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (connection, client) = authenticated().await;

    connection.disconnect(4100, "bye").await;
    connection.disconnect(4200, "again").await;

    assert_eq!(closed_with(&client).await, Some(4100));
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_disconnect_reports_disconnected_immediately() {
    let (connection, _client) = authenticated().await;
    let mut events = connection.events();

    // The client never acknowledges the close.
    connection.disconnect(close_code::UNAUTHENTICATED, "bye").await;

    assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Disconnected);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_attach_resets_authentication() {
    let (connection, client) = authenticated().await;
    drop_client(&connection, &client).await;

    let (socket, fresh) = memory::pair(None);
    let mut events = connection.events();
    connection.attach(socket).await;

    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
    assert_eq!(
        next_signal(&fresh).await,
        AuthenticationSignal::ask(Factor::Confirmation, None)
    );
    assert!(connection.is_connected());
    assert!(!connection.is_authenticated());
    let state = connection.factor(Factor::Confirmation).await;
    assert_eq!(state.verified, None);
    assert!(state.required);
}

#[tokio::test]
async fn test_attach_announces_aggregate_again() {
    let (connection, client) = authenticated().await;
    drop_client(&connection, &client).await;

    let (socket, fresh) = memory::pair(None);
    connection.attach(socket).await;
    next_signal(&fresh).await;
    connection.confirm(true).await.unwrap();

    next_signal(&fresh).await;
    let aggregate = next_signal(&fresh).await;
    assert_eq!(aggregate.status, AuthStatus::Allow);
    assert_eq!(aggregate.id.as_ref(), Some(connection.id()));
}

#[tokio::test]
async fn test_old_socket_close_does_not_affect_new_socket() {
    let (socket, old) = memory::pair(None);
    let connection = Connection::new(socket, ConnectionOptions::default()).unwrap();
    connection.start().await;
    connection.disconnect(1000, "").await;

    let (socket, _fresh) = memory::pair(None);
    connection.attach(socket).await;
    old.close().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(connection.is_connected());
}
