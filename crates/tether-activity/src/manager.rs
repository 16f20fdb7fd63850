//! Activity manager: answers the `newActivity` control channel on every
//! connection, and owns the activities it creates.
//!
//! ```text
//!  client                         Activities
//!    │ newActivity {status:0, plugin}   │
//!    ├─────────────────────────────────→│ Activity::new
//!    │←──────── {status:0, id, plugin} ─┤
//!    │ newActivity {status:1, id}       │
//!    ├─────────────────────────────────→│ advance(Init)   → plugging
//!    │←──────── {status:1, id, plugin} ─┤
//!    │                                  │ advance(Ready)  → plugged
//!    │ newActivity {status:2, id}       │
//!    ├─────────────────────────────────→│ close()         → unplugging, unplugged
//!    │←──────── {status:2, id, plugin} ─┤
//! ```
//!
//! Failures are answered with `status: 2` and a short `error` string.
//!
//! Activities whose connection leaves the pool (grace period over, or
//! explicit removal) are closed and dropped.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use tether_protocol::{
    ActivityId, ActivityStatus, Arg, ConnectionId, NEW_ACTIVITY, NewActivity,
};
use tether_session::{AdmissionHook, Connection, Connections, PoolEvent};
use tether_transport::Socket;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::{Activity, ActivityError, LifecycleStatus, PluginRegistry};

struct Shared<S: Socket> {
    connections: Connections<S>,
    registry: PluginRegistry<S>,
    activities: Mutex<HashMap<ActivityId, Arc<Activity<S>>>>,
    /// Control-channel task per watched connection.
    watched: Mutex<HashMap<ConnectionId, JoinHandle<()>>>,
    pool_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S: Socket> Drop for Shared<S> {
    fn drop(&mut self) {
        if let Ok(mut task) = self.pool_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        for task in self.watched.get_mut().values() {
            task.abort();
        }
    }
}

/// Creates and tracks activities for a connection pool.
///
/// Cheap to clone. Background tasks stop once the last clone is dropped.
pub struct Activities<S: Socket> {
    shared: Arc<Shared<S>>,
}

impl<S: Socket> Clone for Activities<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Socket> Activities<S> {
    /// Starts serving `newActivity` on every connection of `connections`,
    /// present and future.
    pub async fn new(connections: Connections<S>, registry: PluginRegistry<S>) -> Self {
        // Subscribe before listing, so nothing added in between is missed.
        let mut events = connections.subscribe();
        let shared = Arc::new(Shared {
            connections,
            registry,
            activities: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashMap::new()),
            pool_task: std::sync::Mutex::new(None),
        });

        // Hook first, then list: every connection is caught by one or the
        // other. The hook opens the control channel before the first read.
        shared.connections.on_admit(Arc::new(ControlHook {
            shared: Arc::downgrade(&shared),
        }));
        for connection in shared.connections.list().await {
            watch(&shared, connection).await;
        }

        let weak = Arc::downgrade(&shared);
        let task = tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                match event {
                    Ok(PoolEvent::Added(connection)) => watch(&shared, connection).await,
                    Ok(PoolEvent::Removed(id)) => release(&shared, &id).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "activity manager lagged behind the pool");
                        resync(&shared).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Ok(mut slot) = shared.pool_task.lock() {
            *slot = Some(task);
        }

        Self { shared }
    }

    /// The pool this manager serves.
    pub fn connections(&self) -> &Connections<S> {
        &self.shared.connections
    }

    /// Opens an activity on `connection` from the server side.
    ///
    /// This is what a `newActivity` open request does.
    pub async fn open(
        &self,
        connection: &Arc<Connection<S>>,
        plugin: &str,
    ) -> Result<Arc<Activity<S>>, ActivityError> {
        open(&self.shared, connection, plugin).await
    }

    /// Closes and drops an activity. Returns `false` if it didn't exist.
    pub async fn remove(&self, id: &ActivityId) -> bool {
        remove(&self.shared, id).await
    }

    pub async fn find(&self, id: &ActivityId) -> Option<Arc<Activity<S>>> {
        self.shared.activities.lock().await.get(id).cloned()
    }

    /// Activities bound to one connection.
    pub async fn for_connection(&self, id: &ConnectionId) -> Vec<Arc<Activity<S>>> {
        self.shared
            .activities
            .lock()
            .await
            .values()
            .filter(|a| a.connection_id() == id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.shared.activities.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

/// Opens the control channel of every new connection before it reads.
struct ControlHook<S: Socket> {
    shared: Weak<Shared<S>>,
}

#[async_trait]
impl<S: Socket> AdmissionHook<S> for ControlHook<S> {
    async fn admitted(&self, connection: &Arc<Connection<S>>) {
        if let Some(shared) = self.shared.upgrade() {
            watch(&shared, Arc::clone(connection)).await;
        }
    }
}

/// Starts reading `newActivity` on `connection`, once per connection.
async fn watch<S: Socket>(shared: &Arc<Shared<S>>, connection: Arc<Connection<S>>) {
    let mut watched = shared.watched.lock().await;
    if watched.contains_key(connection.id()) {
        return;
    }

    let mut control = connection.subscribe(NEW_ACTIVITY).await;
    let weak_shared = Arc::downgrade(shared);
    let weak_connection = Arc::downgrade(&connection);
    let task = tokio::spawn(async move {
        while let Some(body) = control.recv().await {
            let (Some(shared), Some(connection)) = (weak_shared.upgrade(), weak_connection.upgrade())
            else {
                break;
            };
            handle_control(&shared, &connection, &body).await;
        }
    });
    watched.insert(connection.id().clone(), task);
    tracing::trace!(id = %connection.id(), "watching control channel");
}

async fn handle_control<S: Socket>(
    shared: &Arc<Shared<S>>,
    connection: &Arc<Connection<S>>,
    body: &[Arg],
) {
    let request: NewActivity = match body.first().map(Arg::parse) {
        Some(Ok(request)) => request,
        _ => {
            tracing::debug!(id = %connection.id(), "dropping malformed newActivity message");
            return;
        }
    };

    let reply = match request.status {
        ActivityStatus::Open => match open(shared, connection, &request.plugin).await {
            Ok(activity) => NewActivity::reply(
                ActivityStatus::Open,
                activity.id().clone(),
                activity.plugin_name(),
            ),
            Err(e) => failure(connection, request, e),
        },
        ActivityStatus::Start => match owned(shared, connection, request.id.as_ref()).await {
            Ok(activity) => {
                activity.advance(LifecycleStatus::Init).await;
                let reply = NewActivity::reply(
                    ActivityStatus::Start,
                    activity.id().clone(),
                    activity.plugin_name(),
                );
                // `ready` waits until the reply has been handed over.
                if send_reply(connection, &reply).await {
                    activity.advance(LifecycleStatus::Ready).await;
                }
                return;
            }
            Err(e) => failure(connection, request, e),
        },
        ActivityStatus::Close => match owned(shared, connection, request.id.as_ref()).await {
            Ok(activity) => {
                remove(shared, activity.id()).await;
                NewActivity::reply(
                    ActivityStatus::Close,
                    activity.id().clone(),
                    activity.plugin_name(),
                )
            }
            Err(e) => failure(connection, request, e),
        },
    };
    send_reply(connection, &reply).await;
}

fn failure<S: Socket>(
    connection: &Connection<S>,
    request: NewActivity,
    error: ActivityError,
) -> NewActivity {
    tracing::debug!(id = %connection.id(), error = %error, "newActivity request failed");
    NewActivity::failure(request.id, request.plugin, error.to_string())
}

/// Returns `true` once the reply was handed to the transport.
async fn send_reply<S: Socket>(connection: &Connection<S>, reply: &NewActivity) -> bool {
    let body = match Arg::json(reply) {
        Ok(arg) => vec![arg],
        Err(e) => {
            tracing::error!(id = %connection.id(), error = %e, "failed to encode newActivity reply");
            return false;
        }
    };
    match connection.send(NEW_ACTIVITY, body).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(id = %connection.id(), error = %e, "failed to send newActivity reply");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Bookkeeping
// ---------------------------------------------------------------------------

async fn open<S: Socket>(
    shared: &Shared<S>,
    connection: &Arc<Connection<S>>,
    plugin: &str,
) -> Result<Arc<Activity<S>>, ActivityError> {
    let activity = Activity::new(Arc::clone(connection), plugin, &shared.registry)?;
    shared
        .activities
        .lock()
        .await
        .insert(activity.id().clone(), Arc::clone(&activity));
    tracing::info!(id = %activity.id(), connection = %connection.id(), %plugin, "activity opened");
    Ok(activity)
}

/// Looks up an activity that belongs to `connection`.
async fn owned<S: Socket>(
    shared: &Shared<S>,
    connection: &Connection<S>,
    id: Option<&ActivityId>,
) -> Result<Arc<Activity<S>>, ActivityError> {
    let id = id.ok_or(ActivityError::MissingId)?;
    let activity = shared
        .activities
        .lock()
        .await
        .get(id)
        .cloned()
        .ok_or_else(|| ActivityError::NotFound(id.clone()))?;
    if activity.connection_id() != connection.id() {
        return Err(ActivityError::NotOwner(id.clone()));
    }
    Ok(activity)
}

async fn remove<S: Socket>(shared: &Shared<S>, id: &ActivityId) -> bool {
    let Some(activity) = shared.activities.lock().await.remove(id) else {
        return false;
    };
    activity.close().await;
    tracing::info!(%id, connection = %activity.connection_id(), "activity closed");
    true
}

/// Stops watching a connection that left the pool and closes its
/// activities.
async fn release<S: Socket>(shared: &Shared<S>, id: &ConnectionId) {
    if let Some(task) = shared.watched.lock().await.remove(id) {
        task.abort();
    }

    let orphaned: Vec<ActivityId> = shared
        .activities
        .lock()
        .await
        .values()
        .filter(|a| a.connection_id() == id)
        .map(|a| a.id().clone())
        .collect();
    for activity in &orphaned {
        remove(shared, activity).await;
    }
    if !orphaned.is_empty() {
        tracing::info!(connection = %id, count = orphaned.len(), "released activities of removed connection");
    }
}

/// Rebuilds the watch set from the pool after missed events.
async fn resync<S: Socket>(shared: &Arc<Shared<S>>) {
    let pooled = shared.connections.list().await;
    for connection in &pooled {
        watch(shared, Arc::clone(connection)).await;
    }

    let gone: Vec<ConnectionId> = shared
        .watched
        .lock()
        .await
        .keys()
        .filter(|id| !pooled.iter().any(|c| c.id() == *id))
        .cloned()
        .collect();
    for id in &gone {
        release(shared, id).await;
    }
}
