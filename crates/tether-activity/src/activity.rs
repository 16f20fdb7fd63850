//! Activity: one plugin instance bound to one connection.

use std::sync::Arc;

use tether_protocol::{ActivityId, ConnectionId};
use tether_session::Connection;
use tether_transport::Socket;
use tokio::sync::Mutex;

use crate::{ActivityConnection, ActivityError, LifecycleStatus, Plugin, PluginRegistry};

struct Inner {
    status: Option<LifecycleStatus>,
    plugin: Box<dyn Plugin>,
}

/// A running plugin instance and the connection it talks over.
pub struct Activity<S: Socket> {
    id: ActivityId,
    plugin_name: String,
    connection: Arc<Connection<S>>,
    // The lock also serializes hook calls.
    inner: Mutex<Inner>,
}

impl<S: Socket> Activity<S> {
    /// Builds the plugin instance for a new activity on `connection`.
    ///
    /// No hook runs yet; the status stays unset until the activity is
    /// started or closed.
    ///
    /// # Errors
    /// - [`ActivityError::NotConnected`] / [`ActivityError::NotAuthenticated`]
    ///   if the connection can't carry traffic.
    /// - [`ActivityError::UnknownPlugin`] if `plugin` isn't registered.
    pub fn new(
        connection: Arc<Connection<S>>,
        plugin: &str,
        registry: &PluginRegistry<S>,
    ) -> Result<Arc<Self>, ActivityError> {
        if !connection.is_connected() {
            return Err(ActivityError::NotConnected(connection.id().clone()));
        }
        if !connection.is_authenticated() {
            return Err(ActivityError::NotAuthenticated(connection.id().clone()));
        }

        let id = ActivityId::generate();
        let view = ActivityConnection::new(id.clone(), Arc::clone(&connection));
        let instance = registry
            .create(plugin, view)
            .ok_or_else(|| ActivityError::UnknownPlugin(plugin.to_string()))?;

        Ok(Arc::new(Self {
            id,
            plugin_name: plugin.to_string(),
            connection,
            inner: Mutex::new(Inner {
                status: None,
                plugin: instance,
            }),
        }))
    }

    pub fn id(&self) -> &ActivityId {
        &self.id
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn connection(&self) -> &Arc<Connection<S>> {
        &self.connection
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// `None` until the first transition.
    pub async fn status(&self) -> Option<LifecycleStatus> {
        self.inner.lock().await.status
    }

    /// Moves to `target` and runs its hook.
    ///
    /// Returns `false` without doing anything if the activity is already
    /// at or past `target`.
    pub async fn advance(&self, target: LifecycleStatus) -> bool {
        let mut inner = self.inner.lock().await;
        if !target.follows(inner.status) {
            return false;
        }
        inner.status = Some(target);

        let plugin = &mut inner.plugin;
        match target {
            LifecycleStatus::Init => plugin.plugging().await,
            LifecycleStatus::Ready => plugin.plugged().await,
            LifecycleStatus::Cleanup => plugin.unplugging().await,
            LifecycleStatus::Close => plugin.unplugged().await,
        }
        tracing::debug!(id = %self.id, status = %target, "activity transitioned");
        true
    }

    /// Runs `cleanup` then `close`, skipping whichever already happened.
    pub async fn close(&self) {
        self.advance(LifecycleStatus::Cleanup).await;
        self.advance(LifecycleStatus::Close).await;
    }
}

impl<S: Socket> std::fmt::Debug for Activity<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id)
            .field("plugin", &self.plugin_name)
            .field("connection", self.connection.id())
            .finish_non_exhaustive()
    }
}
