//! `ActivityConnection`: one activity's view of a shared connection.
//!
//! Several activities can run over the same client connection. To keep
//! their traffic apart, every message name is prefixed with the activity
//! id: a plugin sending `"frame"` puts `"<activityId>:frame"` on the wire,
//! and subscribing to `"input"` only sees `"<activityId>:input"`.

use std::sync::Arc;

use tether_protocol::{ActivityId, Arg, ConnectionId};
use tether_session::{Connection, SessionError};
use tether_transport::Socket;
use tokio::sync::mpsc;

/// A connection scoped to one activity.
///
/// Holds no state of its own beyond the two ids; cheap to clone.
pub struct ActivityConnection<S: Socket> {
    activity: ActivityId,
    connection: Arc<Connection<S>>,
}

impl<S: Socket> Clone for ActivityConnection<S> {
    fn clone(&self) -> Self {
        Self {
            activity: self.activity.clone(),
            connection: Arc::clone(&self.connection),
        }
    }
}

impl<S: Socket> ActivityConnection<S> {
    pub fn new(activity: ActivityId, connection: Arc<Connection<S>>) -> Self {
        Self {
            activity,
            connection,
        }
    }

    pub fn activity_id(&self) -> &ActivityId {
        &self.activity
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_authenticated(&self) -> bool {
        self.connection.is_authenticated()
    }

    /// Returns the wire name for `name`.
    pub fn scoped(&self, name: &str) -> String {
        format!("{}:{}", self.activity, name)
    }

    /// See [`Connection::send`].
    pub async fn send(&self, name: &str, body: Vec<Arg>) -> Result<(), SessionError> {
        self.connection.send(&self.scoped(name), body).await
    }

    /// See [`Connection::send_binary`].
    pub async fn send_binary(&self, name: &str, body: Vec<Arg>) -> Result<(), SessionError> {
        self.connection.send_binary(&self.scoped(name), body).await
    }

    /// See [`Connection::request`].
    pub async fn request(&self, name: &str, body: Vec<Arg>) -> Result<Vec<Arg>, SessionError> {
        self.connection.request(&self.scoped(name), body).await
    }

    /// See [`Connection::subscribe`].
    pub async fn subscribe(&self, name: &str) -> mpsc::UnboundedReceiver<Vec<Arg>> {
        self.connection.subscribe(&self.scoped(name)).await
    }
}

impl<S: Socket> std::fmt::Debug for ActivityConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityConnection")
            .field("activity", &self.activity)
            .field("connection", self.connection.id())
            .finish()
    }
}
