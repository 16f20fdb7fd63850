//! # Tether
//!
//! Session protocol server for remote-control clients.
//!
//! Untrusted clients connect over WebSocket, authenticate through an
//! ordered list of factors (a passport secret, then operator confirmation),
//! and then open any number of plugin activities multiplexed over their
//! one connection. A dropped client can reconnect with its previous id
//! within a grace period and keep its session.
//!
//! This crate re-exports the layers and adds the server that wires them
//! together:
//!
//! - `tether-transport`: sockets and the WebSocket listener
//! - `tether-protocol`: messages, control payloads, the JSON codec
//! - `tether-session`: connections, authentication, reconnection
//! - `tether-activity`: plugins and activities
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! struct Quiet;
//!
//! #[async_trait::async_trait]
//! impl Plugin for Quiet {}
//!
//! # async fn run() -> Result<(), TetherError> {
//! tether::init_tracing();
//! let server = TetherServer::builder()
//!     .bind("0.0.0.0:8080")
//!     .settings_path("settings.json")
//!     .plugin("quiet", |_conn| Quiet)
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod error;
mod registry;
mod server;

pub use error::TetherError;
pub use registry::ManagerRegistry;
pub use server::{TetherServer, TetherServerBuilder};

pub use tether_activity as activity;
pub use tether_protocol as protocol;
pub use tether_session as session;
pub use tether_transport as transport;

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber that prints to stderr, filtered by
/// `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Everything an application needs to run a server and write plugins.
pub mod prelude {
    pub use crate::{ManagerRegistry, TetherError, TetherServer, TetherServerBuilder};
    pub use tether_activity::{
        Activities, Activity, ActivityConnection, ActivityError, LifecycleStatus, Plugin,
        PluginRegistry,
    };
    pub use tether_protocol::{ActivityId, Arg, ConnectionId, Factor, Message};
    pub use tether_session::{
        Connection, ConnectionEvent, Connections, ConnectionsConfig, FactorConfig, SessionError,
    };
    pub use tether_transport::{ConnectInfo, Socket, WebSocketSocket};
}
