//! The `Plugin` trait and the registry of plugin types.
//!
//! A plugin is the application code behind an activity. Tether never
//! looks inside it; it constructs one per activity through a factory
//! registered under a type name, hands it an [`ActivityConnection`], and
//! calls the four lifecycle hooks at the right time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tether_transport::Socket;

use crate::ActivityConnection;

/// Lifecycle hooks of a plugin instance.
///
/// Every hook defaults to a no-op. Each one is called at most once per
/// instance, in this order (states may be skipped, never repeated):
///
/// | hook         | entered state |
/// |--------------|---------------|
/// | `plugging`   | init          |
/// | `plugged`    | ready         |
/// | `unplugging` | cleanup       |
/// | `unplugged`  | close         |
///
/// `#[async_trait]` because instances are stored as `Box<dyn Plugin>`.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// The client asked to start the activity.
    async fn plugging(&mut self) {}

    /// The start reply reached the transport; the client is listening.
    async fn plugged(&mut self) {}

    /// The activity is being closed.
    async fn unplugging(&mut self) {}

    /// The activity is gone. Release everything.
    async fn unplugged(&mut self) {}
}

type Factory<S> = Arc<dyn Fn(ActivityConnection<S>) -> Box<dyn Plugin> + Send + Sync>;

/// Plugin factories keyed by type name.
///
/// ## Example
///
/// ```rust
/// use tether_activity::{ActivityConnection, Plugin, PluginRegistry};
/// use tether_transport::memory::MemorySocket;
///
/// struct Quiet;
///
/// #[async_trait::async_trait]
/// impl Plugin for Quiet {}
///
/// let mut registry = PluginRegistry::<MemorySocket>::new();
/// registry.register("quiet", |_conn: ActivityConnection<MemorySocket>| Quiet);
/// assert!(registry.contains("quiet"));
/// ```
pub struct PluginRegistry<S: Socket> {
    factories: HashMap<String, Factory<S>>,
}

impl<S: Socket> PluginRegistry<S> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers a plugin type. A later registration under the same name
    /// replaces the earlier one.
    pub fn register<P, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        P: Plugin,
        F: Fn(ActivityConnection<S>) -> P + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(plugin = %name, "plugin registered");
        let factory: Factory<S> =
            Arc::new(move |conn: ActivityConnection<S>| -> Box<dyn Plugin> {
                Box::new(factory(conn))
            });
        self.factories.insert(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds an instance, or `None` for an unknown name.
    pub(crate) fn create(&self, name: &str, conn: ActivityConnection<S>) -> Option<Box<dyn Plugin>> {
        self.factories.get(name).map(|factory| factory(conn))
    }
}

impl<S: Socket> Default for PluginRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Socket> Clone for PluginRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            factories: self.factories.clone(),
        }
    }
}
