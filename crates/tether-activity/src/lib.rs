//! Plugin activities for Tether.
//!
//! An activity is one plugin instance bound to one authenticated client
//! connection. Clients open, start, and close activities over the reserved
//! `newActivity` channel; many activities can share one connection, each
//! seeing only its own messages.
//!
//! # Key types
//!
//! - [`Plugin`]: the lifecycle hooks application code implements
//! - [`PluginRegistry`]: plugin factories keyed by type name
//! - [`Activity`]: a plugin instance and its lifecycle ([`LifecycleStatus`])
//! - [`ActivityConnection`]: the activity-scoped view of a connection
//! - [`Activities`]: serves the control channel and owns all activities

mod activity;
mod connection;
mod error;
mod lifecycle;
mod manager;
mod plugin;

pub use activity::Activity;
pub use connection::ActivityConnection;
pub use error::ActivityError;
pub use lifecycle::LifecycleStatus;
pub use manager::Activities;
pub use plugin::{Plugin, PluginRegistry};
