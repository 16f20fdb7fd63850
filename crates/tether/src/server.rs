//! `TetherServer` builder and accept loop.
//!
//! The server ties the layers together: every socket the WebSocket
//! transport accepts is handed to the connection pool, and the activity
//! manager serves `newActivity` on every connection in that pool.
//!
//! ```text
//! WebSocketTransport ──accept──→ Connections::add ──Added──→ Activities
//!                                  │                           │
//!                                  └── authentication          └── plugins
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tether_activity::{Activities, ActivityConnection, Plugin, PluginRegistry};
use tether_session::{Admission, Connections, ConnectionsConfig, JsonFileStore};
use tether_transport::{
    DEFAULT_HANDSHAKE_TIMEOUT, Transport, WebSocketSocket, WebSocketTransport,
};

use crate::TetherError;

/// Where the server's connection settings come from.
enum Settings {
    Inline(ConnectionsConfig),
    File(PathBuf),
    Pool(Connections<WebSocketSocket>),
}

/// Builder for configuring and starting a Tether server.
///
/// # Example
///
/// ```rust,ignore
/// use tether::prelude::*;
///
/// let server = TetherServer::builder()
///     .bind("0.0.0.0:8080")
///     .settings_path("settings.json")
///     .plugin("terminal", Terminal::new)
///     .build()
///     .await?;
/// server.run().await
/// ```
pub struct TetherServerBuilder {
    bind_addr: String,
    handshake_timeout: Duration,
    settings: Settings,
    plugins: PluginRegistry<WebSocketSocket>,
}

impl TetherServerBuilder {
    /// Creates a builder with default settings: `127.0.0.1:8080`,
    /// confirmation-only authentication, nothing persisted, no plugins.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            settings: Settings::Inline(ConnectionsConfig::default()),
            plugins: PluginRegistry::new(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// How long a client gets to finish the WebSocket upgrade.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Uses `config` as-is. Operator changes are not persisted.
    pub fn config(mut self, config: ConnectionsConfig) -> Self {
        self.settings = Settings::Inline(config);
        self
    }

    /// Loads settings from a JSON file and saves operator changes back to it.
    pub fn settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings = Settings::File(path.into());
        self
    }

    /// Serves an existing pool, e.g. one from a
    /// [`ManagerRegistry`](crate::ManagerRegistry).
    pub fn connections(mut self, connections: Connections<WebSocketSocket>) -> Self {
        self.settings = Settings::Pool(connections);
        self
    }

    /// Registers a plugin type under `name`.
    pub fn plugin<P, F>(mut self, name: &str, factory: F) -> Self
    where
        P: Plugin,
        F: Fn(ActivityConnection<WebSocketSocket>) -> P + Send + Sync + 'static,
    {
        self.plugins.register(name, factory);
        self
    }

    /// Replaces the whole plugin registry.
    pub fn plugins(mut self, plugins: PluginRegistry<WebSocketSocket>) -> Self {
        self.plugins = plugins;
        self
    }

    /// Binds the listener and starts the activity manager.
    ///
    /// # Errors
    /// - [`TetherError::Transport`] if the address can't be bound.
    /// - [`TetherError::Session`] if the settings are invalid or the
    ///   settings file can't be read.
    pub async fn build(self) -> Result<TetherServer, TetherError> {
        let connections = match self.settings {
            Settings::Inline(config) => Connections::new(config)?,
            Settings::File(path) => Connections::with_store(JsonFileStore::new(path))?,
            Settings::Pool(connections) => connections,
        };
        let transport =
            WebSocketTransport::bind_with_timeout(&self.bind_addr, self.handshake_timeout).await?;
        tracing::info!(plugins = ?self.plugins.names(), "plugins registered");
        let activities = Activities::new(connections.clone(), self.plugins).await;

        Ok(TetherServer {
            transport,
            connections,
            activities,
        })
    }
}

impl Default for TetherServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Tether server.
///
/// Call [`run()`](Self::run) to start accepting connections. The pool and
/// activity manager are usable before and while the server runs.
pub struct TetherServer {
    transport: WebSocketTransport,
    connections: Connections<WebSocketSocket>,
    activities: Activities<WebSocketSocket>,
}

impl TetherServer {
    pub fn builder() -> TetherServerBuilder {
        TetherServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TetherError> {
        Ok(self.transport.local_addr()?)
    }

    /// The connection pool, for operator actions such as confirming a
    /// connection or changing factors.
    pub fn connections(&self) -> &Connections<WebSocketSocket> {
        &self.connections
    }

    pub fn activities(&self) -> &Activities<WebSocketSocket> {
        &self.activities
    }

    /// Runs the accept loop until the process is terminated.
    ///
    /// The transport upgrades each client on its own task, and each
    /// upgraded socket is admitted on its own task, so neither a slow
    /// handshake nor a slow admission holds up the listener.
    pub async fn run(mut self) -> Result<(), TetherError> {
        tracing::info!("Tether server running");

        loop {
            match self.transport.accept().await {
                Ok((socket, info)) => {
                    let connections = self.connections.clone();
                    tokio::spawn(async move {
                        match connections.add(socket, &info).await {
                            Ok(Admission::Created(connection)) => {
                                tracing::debug!(id = %connection.id(), "socket admitted");
                            }
                            Ok(Admission::Resumed(connection)) => {
                                tracing::debug!(id = %connection.id(), "socket resumed a connection");
                            }
                            Ok(Admission::Rejected(code)) => {
                                tracing::debug!(code, "socket rejected");
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "failed to admit socket");
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}
