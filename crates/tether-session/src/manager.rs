//! The connection pool: admission, reconnection, grace periods, and
//! broadcast.
//!
//! [`Connections`] is the entry point for the accept loop. Every accepted
//! socket goes through [`Connections::add`], which decides between three
//! outcomes:
//!
//! ```text
//! add(socket, info)
//!   ├── no previousConnectionId ──────────────→ Created  (new Connection)
//!   └── previousConnectionId = id
//!         ├── id not in pool ─────────────────→ Rejected(4001)
//!         ├── id still connected ─────────────→ Rejected(4002)
//!         └── id disconnected, in grace ──────→ Resumed  (socket swapped)
//! ```
//!
//! # Grace period
//!
//! When a connection's socket ends, a timer of `removeTimeout` starts. If
//! the client comes back first, the timer is cancelled; otherwise the
//! connection is evicted and [`PoolEvent::Removed`] is published.
//!
//! # Admission hooks
//!
//! An [`AdmissionHook`] runs inside [`Connections::add`] after the new
//! connection joined the pool and before its socket is read, so whatever
//! the hook subscribes to sees the client's very first message.
//!
//! # Concurrency note
//!
//! The pool map and the eviction timers are only touched under the pool
//! lock. Every timer carries the entry's epoch at the time it was armed;
//! reconnection bumps the epoch under the same lock, so a timer that fires
//! late sees a stale epoch and does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tether_protocol::{Arg, ConnectionId, PREVIOUS_CONNECTION_ID, close_code};
use tether_transport::{ConnectInfo, Socket};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::connection::NORMAL_CLOSE;
use crate::{
    Connection, ConnectionEvent, ConnectionOptions, ConnectionsConfig, FactorConfig, Passport,
    SaltedPassport, SessionError, SettingsStore,
};

/// Capacity of the pool event channel.
const POOL_EVENT_CHANNEL_SIZE: usize = 256;

/// What [`Connections::add`] did with a socket.
pub enum Admission<S: Socket> {
    /// A new connection was created.
    Created(Arc<Connection<S>>),
    /// The socket was attached to an existing connection.
    Resumed(Arc<Connection<S>>),
    /// The socket was closed with this code.
    Rejected(u16),
}

impl<S: Socket> Admission<S> {
    /// The connection the socket ended up in, unless rejected.
    pub fn connection(&self) -> Option<&Arc<Connection<S>>> {
        match self {
            Self::Created(c) | Self::Resumed(c) => Some(c),
            Self::Rejected(_) => None,
        }
    }
}

impl<S: Socket> std::fmt::Debug for Admission<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created(c) => f.debug_tuple("Created").field(c.id()).finish(),
            Self::Resumed(c) => f.debug_tuple("Resumed").field(c.id()).finish(),
            Self::Rejected(code) => f.debug_tuple("Rejected").field(code).finish(),
        }
    }
}

/// Pool membership changes.
pub enum PoolEvent<S: Socket> {
    Added(Arc<Connection<S>>),
    Removed(ConnectionId),
}

// Derived Clone would require `S: Clone`.
impl<S: Socket> Clone for PoolEvent<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Added(c) => Self::Added(Arc::clone(c)),
            Self::Removed(id) => Self::Removed(id.clone()),
        }
    }
}

impl<S: Socket> std::fmt::Debug for PoolEvent<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added(c) => f.debug_tuple("Added").field(c.id()).finish(),
            Self::Removed(id) => f.debug_tuple("Removed").field(id).finish(),
        }
    }
}

/// Runs on every connection [`Connections::add`] creates, before the
/// connection starts reading its socket.
///
/// Resumed connections don't run hooks again; they keep their
/// subscriptions across sockets.
#[async_trait]
pub trait AdmissionHook<S: Socket>: Send + Sync + 'static {
    async fn admitted(&self, connection: &Arc<Connection<S>>);
}

struct Entry<S: Socket> {
    connection: Arc<Connection<S>>,
    eviction: Option<JoinHandle<()>>,
    epoch: u64,
}

struct Settings {
    config: ConnectionsConfig,
    passport: Option<Arc<dyn Passport>>,
    store: Option<Box<dyn SettingsStore>>,
}

impl Settings {
    /// Saves `config` to the store (if any), then makes it current.
    fn commit(&mut self, config: ConnectionsConfig) -> Result<(), SessionError> {
        if let Some(store) = &self.store {
            store.save(&config)?;
        }
        self.config = config;
        Ok(())
    }
}

struct Shared<S: Socket> {
    pool: Mutex<HashMap<ConnectionId, Entry<S>>>,
    settings: Mutex<Settings>,
    hooks: std::sync::Mutex<Vec<Arc<dyn AdmissionHook<S>>>>,
    events: broadcast::Sender<PoolEvent<S>>,
}

/// The pool of client connections.
///
/// Cheap to clone; clones share the same pool.
pub struct Connections<S: Socket> {
    shared: Arc<Shared<S>>,
}

impl<S: Socket> Clone for Connections<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Socket> Connections<S> {
    /// Creates an empty pool with the given settings. Nothing is persisted.
    ///
    /// # Errors
    /// - [`SessionError::NoRequiredFactor`] if no factor is required.
    /// - [`SessionError::UnsupportedPassport`] for an unknown passport type.
    /// - [`SessionError::PassportUnavailable`] if passport is required
    ///   but no passport record is set.
    pub fn new(config: ConnectionsConfig) -> Result<Self, SessionError> {
        Self::build(config, None)
    }

    /// Creates an empty pool with settings loaded from `store`, or the
    /// defaults if it holds nothing yet. Later changes are saved back.
    pub fn with_store(store: impl SettingsStore) -> Result<Self, SessionError> {
        let config = store.load()?.unwrap_or_default();
        Self::build(config, Some(Box::new(store)))
    }

    fn build(
        config: ConnectionsConfig,
        store: Option<Box<dyn SettingsStore>>,
    ) -> Result<Self, SessionError> {
        config.authentication_factors.validate()?;
        let passport: Option<Arc<dyn Passport>> = match &config.passport {
            Some(record) => Some(Arc::new(SaltedPassport::from_record(record.clone())?)),
            None => None,
        };
        if config.authentication_factors.passport && passport.is_none() {
            return Err(SessionError::PassportUnavailable);
        }

        let (events, _) = broadcast::channel(POOL_EVENT_CHANNEL_SIZE);
        Ok(Self {
            shared: Arc::new(Shared {
                pool: Mutex::new(HashMap::new()),
                settings: Mutex::new(Settings {
                    config,
                    passport,
                    store,
                }),
                hooks: std::sync::Mutex::new(Vec::new()),
                events,
            }),
        })
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Admits an accepted socket: creates a connection, resumes one, or
    /// closes the socket with a rejection code.
    ///
    /// # Errors
    /// Only if a connection can't be built from the current settings,
    /// which the setters below prevent.
    pub async fn add(&self, socket: S, info: &ConnectInfo) -> Result<Admission<S>, SessionError> {
        if let Some(previous) = info.param(PREVIOUS_CONNECTION_ID) {
            return Ok(self.resume(socket, ConnectionId::from(previous)).await);
        }

        let options = self.connection_options().await;
        let connection = Connection::new(socket, options)?;
        let id = connection.id().clone();
        // Watch before starting, so a socket that closes immediately is
        // still seen disconnecting.
        self.watch(&connection);
        self.shared.pool.lock().await.insert(
            id.clone(),
            Entry {
                connection: Arc::clone(&connection),
                eviction: None,
                epoch: 0,
            },
        );
        let _ = self
            .shared
            .events
            .send(PoolEvent::Added(Arc::clone(&connection)));
        for hook in self.hooks() {
            hook.admitted(&connection).await;
        }
        connection.start().await;

        let address = connection.address().await;
        tracing::info!(%id, ?address, "connection created");
        Ok(Admission::Created(connection))
    }

    /// Registers a hook that runs on every connection created from now on.
    pub fn on_admit(&self, hook: Arc<dyn AdmissionHook<S>>) {
        if let Ok(mut hooks) = self.shared.hooks.lock() {
            hooks.push(hook);
        }
    }

    fn hooks(&self) -> Vec<Arc<dyn AdmissionHook<S>>> {
        self.shared
            .hooks
            .lock()
            .map(|hooks| hooks.clone())
            .unwrap_or_default()
    }

    async fn resume(&self, socket: S, id: ConnectionId) -> Admission<S> {
        let mut pool = self.shared.pool.lock().await;
        let code = match pool.get_mut(&id) {
            None => close_code::UNKNOWN_CONNECTION,
            Some(entry) if entry.connection.is_connected() => close_code::ALREADY_CONNECTED,
            Some(entry) => {
                entry.epoch += 1;
                if let Some(timer) = entry.eviction.take() {
                    timer.abort();
                }
                let connection = Arc::clone(&entry.connection);
                // The swap happens under the pool lock so a firing timer
                // sees the bumped epoch; the announcement goes out without it.
                connection.replace_socket(socket).await;
                drop(pool);
                connection.announce().await;
                tracing::info!(%id, "connection resumed");
                return Admission::Resumed(connection);
            }
        };
        drop(pool);

        tracing::info!(%id, code, "reconnection rejected");
        if let Err(e) = socket.close(code, "reconnection rejected").await {
            tracing::debug!(%id, error = %e, "failed to close rejected socket");
        }
        Admission::Rejected(code)
    }

    async fn connection_options(&self) -> ConnectionOptions {
        let settings = self.shared.settings.lock().await;
        ConnectionOptions {
            factors: settings.config.authentication_factors,
            passport: settings.passport.clone(),
            request_timeout: settings.config.request_timeout(),
        }
    }

    /// Spawns the task that arms the grace period whenever `connection`
    /// loses its socket.
    fn watch(&self, connection: &Arc<Connection<S>>) {
        let mut events = connection.events();
        let weak_connection = Arc::downgrade(connection);
        let weak_shared = Arc::downgrade(&self.shared);
        let id = connection.id().clone();

        tokio::spawn(async move {
            loop {
                let lost = match events.recv().await {
                    Ok(ConnectionEvent::Disconnected) => true,
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(%id, skipped, "connection watcher lagged");
                        // A skipped Disconnected shows in the current state.
                        weak_connection
                            .upgrade()
                            .is_some_and(|c| !c.is_connected())
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !lost {
                    continue;
                }
                let Some(shared) = weak_shared.upgrade() else {
                    break;
                };
                arm_eviction(&shared, &id).await;
            }
        });
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Connections that are connected and authenticated.
    pub async fn get(&self) -> Vec<Arc<Connection<S>>> {
        self.shared
            .pool
            .lock()
            .await
            .values()
            .filter(|e| e.connection.is_connected() && e.connection.is_authenticated())
            .map(|e| Arc::clone(&e.connection))
            .collect()
    }

    /// Every pooled connection, including those in their grace period.
    pub async fn list(&self) -> Vec<Arc<Connection<S>>> {
        self.shared
            .pool
            .lock()
            .await
            .values()
            .map(|e| Arc::clone(&e.connection))
            .collect()
    }

    pub async fn find(&self, id: &ConnectionId) -> Option<Arc<Connection<S>>> {
        self.shared
            .pool
            .lock()
            .await
            .get(id)
            .map(|e| Arc::clone(&e.connection))
    }

    pub async fn len(&self) -> usize {
        self.shared.pool.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Subscribes to pool membership changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent<S>> {
        self.shared.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Removes a connection right away, closing its socket.
    ///
    /// Returns `false` if it wasn't pooled.
    pub async fn remove(&self, id: &ConnectionId) -> bool {
        let Some(entry) = self.shared.pool.lock().await.remove(id) else {
            return false;
        };
        if let Some(timer) = entry.eviction {
            timer.abort();
        }
        entry.connection.disconnect(NORMAL_CLOSE, "removed").await;
        let _ = self.shared.events.send(PoolEvent::Removed(id.clone()));
        tracing::info!(%id, "connection removed");
        true
    }

    // -----------------------------------------------------------------------
    // Broadcast
    // -----------------------------------------------------------------------

    /// Sends `[name, body]` to every connected, authenticated connection,
    /// one after another.
    ///
    /// A recipient that fails is logged and skipped. Returns how many
    /// recipients the message was handed to.
    pub async fn send(&self, name: &str, body: Vec<Arg>) -> usize {
        self.broadcast(name, body, false).await
    }

    /// Same as [`Connections::send`], but as binary frames.
    pub async fn send_binary(&self, name: &str, body: Vec<Arg>) -> usize {
        self.broadcast(name, body, true).await
    }

    async fn broadcast(&self, name: &str, body: Vec<Arg>, binary: bool) -> usize {
        let mut reached = 0;
        for connection in self.get().await {
            let result = if binary {
                connection.send_binary(name, body.clone()).await
            } else {
                connection.send(name, body.clone()).await
            };
            match result {
                Ok(()) => reached += 1,
                Err(e) => {
                    tracing::warn!(id = %connection.id(), %name, error = %e, "broadcast skipped a connection");
                }
            }
        }
        reached
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub async fn config(&self) -> ConnectionsConfig {
        self.shared.settings.lock().await.config.clone()
    }

    /// Changes which factors new connections require.
    ///
    /// Existing connections keep the factors they were built with.
    ///
    /// # Errors
    /// [`SessionError::NoRequiredFactor`] or
    /// [`SessionError::PassportUnavailable`]; settings are unchanged.
    pub async fn set_authentication_factors(
        &self,
        factors: FactorConfig,
    ) -> Result<(), SessionError> {
        factors.validate()?;
        let mut settings = self.shared.settings.lock().await;
        if factors.passport && settings.passport.is_none() {
            return Err(SessionError::PassportUnavailable);
        }
        let mut config = settings.config.clone();
        config.authentication_factors = factors;
        settings.commit(config)?;
        tracing::info!(
            confirmation = factors.confirmation,
            passport = factors.passport,
            "authentication factors changed"
        );
        Ok(())
    }

    /// Replaces the passport secret. The new record is persisted.
    pub async fn set_passport(&self, secret: &str) -> Result<(), SessionError> {
        let passport = SaltedPassport::generate(secret);
        let mut settings = self.shared.settings.lock().await;
        let mut config = settings.config.clone();
        config.passport = Some(passport.record().clone());
        settings.commit(config)?;
        settings.passport = Some(Arc::new(passport));
        tracing::info!("passport changed");
        Ok(())
    }

    /// Changes the grace period for connections that disconnect from now on.
    pub async fn set_remove_timeout(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut settings = self.shared.settings.lock().await;
        let mut config = settings.config.clone();
        config.remove_timeout = timeout.as_millis() as u64;
        settings.commit(config)
    }
}

/// Starts the grace period for `id`, replacing any running timer.
async fn arm_eviction<S: Socket>(shared: &Arc<Shared<S>>, id: &ConnectionId) {
    let timeout = shared.settings.lock().await.config.remove_timeout();

    let mut pool = shared.pool.lock().await;
    let Some(entry) = pool.get_mut(id) else {
        return;
    };
    // Already resumed by the time we got the lock.
    if entry.connection.is_connected() {
        return;
    }

    entry.epoch += 1;
    let epoch = entry.epoch;
    if let Some(timer) = entry.eviction.take() {
        timer.abort();
    }

    let weak = Arc::downgrade(shared);
    let timer_id = id.clone();
    entry.eviction = Some(tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        evict(weak, &timer_id, epoch).await;
    }));
    tracing::debug!(%id, ?timeout, "grace period started");
}

async fn evict<S: Socket>(shared: Weak<Shared<S>>, id: &ConnectionId, epoch: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    {
        let mut pool = shared.pool.lock().await;
        match pool.get(id) {
            Some(entry) if entry.epoch == epoch && !entry.connection.is_connected() => {
                pool.remove(id);
            }
            _ => return,
        }
    }
    let _ = shared.events.send(PoolEvent::Removed(id.clone()));
    tracing::info!(%id, "connection evicted after grace period");
}
