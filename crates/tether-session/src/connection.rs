//! One client connection: wire messaging plus the authentication state
//! machine.
//!
//! A [`Connection`] outlives its socket. When the client drops, the
//! connection stays in the pool during a grace period; a reconnecting
//! client hands the server a new socket, which is swapped in with
//! [`Connection::attach`]. Each socket gets its own reader task and a
//! generation number, so a late close from an old socket can't mark the
//! new one disconnected.
//!
//! ```text
//!            new() ──→ start() ──→ [connected] ──socket ends──→ [disconnected]
//!                                      ▲                              │
//!                                      └──────── attach(socket) ──────┘
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tether_protocol::{
    AUTHENTICATE, AUTHENTICATION, Arg, AuthenticateRequest, AuthenticationSignal, Codec,
    ConnectionId, Factor, JsonCodec, Message, close_code,
};
use tether_transport::{Frame, Socket};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::{AuthFactors, FactorConfig, FactorState, Passport, SessionError};

/// Capacity of the per-connection event channel.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Close code used by [`Connection::disconnect`] callers for a plain close.
pub const NORMAL_CLOSE: u16 = 1000;

/// Lifecycle and authentication events of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// An open socket was bound.
    Connected,
    /// The bound socket ended.
    Disconnected,
    /// An authentication signal was sent to the client.
    Authentication(AuthenticationSignal),
}

/// Options for building a [`Connection`].
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Which factors are required.
    pub factors: FactorConfig,
    /// Verifier for the passport factor. Needed if passport is required.
    pub passport: Option<Arc<dyn Passport>>,
    /// How long [`Connection::request`] waits for a reply.
    pub request_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            factors: FactorConfig::default(),
            passport: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Everything that changes when the socket is swapped.
struct State<S> {
    socket: Arc<S>,
    /// Bumped on every socket swap.
    generation: u64,
    address: Option<IpAddr>,
    factors: AuthFactors,
    reader: Option<JoinHandle<()>>,
    /// Tells the current reader to stop reading.
    stop: Option<oneshot::Sender<()>>,
    /// `Disconnected` was already reported for this generation.
    closed: bool,
}

/// A client connection.
///
/// Always used behind an `Arc`: the reader task and the pool hold
/// references of their own.
pub struct Connection<S: Socket> {
    id: ConnectionId,
    passport: Option<Arc<dyn Passport>>,
    request_timeout: Duration,
    codec: JsonCodec,
    state: Mutex<State<S>>,
    listeners: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<Arg>>>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Vec<Arg>>>>,
    events: broadcast::Sender<ConnectionEvent>,
    // Mirrors of the guarded state, readable without awaiting.
    connected: AtomicBool,
    authenticated: AtomicBool,
    dropped_frames: AtomicU64,
}

impl<S: Socket> Connection<S> {
    /// Builds a connection around `socket` with a fresh id.
    ///
    /// The socket isn't read until [`Connection::start`] is called.
    ///
    /// # Errors
    /// - [`SessionError::NoRequiredFactor`] if no factor is required.
    /// - [`SessionError::PassportUnavailable`] if passport is required but
    ///   no verifier is given.
    pub fn new(socket: S, options: ConnectionOptions) -> Result<Arc<Self>, SessionError> {
        let factors = AuthFactors::new(options.factors)?;
        if factors.is_required(Factor::Passport) && options.passport.is_none() {
            return Err(SessionError::PassportUnavailable);
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let address = socket.remote_addr();
        Ok(Arc::new(Self {
            id: ConnectionId::generate(),
            passport: options.passport,
            request_timeout: options.request_timeout,
            codec: JsonCodec,
            state: Mutex::new(State {
                socket: Arc::new(socket),
                generation: 0,
                address,
                factors,
                reader: None,
                stop: None,
                closed: false,
            }),
            listeners: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            events,
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Remote address of the current socket.
    pub async fn address(&self) -> Option<IpAddr> {
        self.state.lock().await.address
    }

    /// `true` while an open socket is bound.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// `true` once every required factor is verified on this socket.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Number of inbound frames dropped because they didn't decode.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Snapshot of one factor's state.
    pub async fn factor(&self, factor: Factor) -> FactorState {
        self.state.lock().await.factors.get(factor)
    }

    /// Subscribes to this connection's events.
    ///
    /// Only events sent after this call are received.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Socket binding
    // -----------------------------------------------------------------------

    /// Starts reading the socket given to [`Connection::new`] and asks for
    /// the first factor.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.reader.is_some() {
                return;
            }
            self.install_reader(&mut state);
        }
        self.announce().await;
    }

    /// Swaps in a new socket, as on reconnection.
    ///
    /// All verification results are cleared (required flags are kept), so
    /// the client has to authenticate again on the new socket.
    pub async fn attach(self: &Arc<Self>, socket: S) {
        self.replace_socket(socket).await;
        self.announce().await;
    }

    /// The synchronous half of [`Connection::attach`]: after it returns,
    /// the new socket is bound and `is_connected` reflects it.
    pub(crate) async fn replace_socket(self: &Arc<Self>, socket: S) {
        let mut state = self.state.lock().await;
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        state.address = socket.remote_addr();
        state.socket = Arc::new(socket);
        state.generation += 1;
        state.closed = false;
        state.factors.reset();
        self.authenticated.store(false, Ordering::SeqCst);
        self.install_reader(&mut state);
        tracing::debug!(id = %self.id, generation = state.generation, "socket replaced");
    }

    /// Emits `Connected` and the first ask, if the bound socket is open.
    pub(crate) async fn announce(self: &Arc<Self>) {
        let signal = {
            let mut state = self.state.lock().await;
            if !state.socket.is_open() {
                return;
            }
            state.factors.next_ask().map(|f| self.ask_signal(f))
        };

        tracing::info!(id = %self.id, "connection attached");
        let _ = self.events.send(ConnectionEvent::Connected);
        if let Some(signal) = signal {
            self.deliver(vec![signal]).await;
        }
    }

    fn install_reader(self: &Arc<Self>, state: &mut State<S>) {
        // Set before the reader runs, so an immediate close can't be
        // overwritten by a late `true`.
        self.connected
            .store(state.socket.is_open(), Ordering::SeqCst);

        let connection = Arc::clone(self);
        let socket = Arc::clone(&state.socket);
        let generation = state.generation;
        let (stop, mut stopped) = oneshot::channel();
        state.stop = Some(stop);
        state.reader = Some(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    received = socket.recv() => received,
                    _ = &mut stopped => break,
                };
                match received {
                    Ok(Some(frame)) => connection.handle_frame(frame).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(id = %connection.id, error = %e, "receive failed");
                        break;
                    }
                }
            }
            connection.handle_close(generation).await;
        }));
    }

    async fn handle_close(&self, generation: u64) {
        {
            let mut state = self.state.lock().await;
            if state.generation != generation || state.closed {
                return;
            }
            state.closed = true;
        }
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiting request.
        self.pending.lock().await.clear();

        tracing::info!(id = %self.id, "connection lost");
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn handle_frame(&self, frame: Frame) {
        let message = match self.codec.decode_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(id = %self.id, error = %e, "dropping malformed frame");
                return;
            }
        };

        if message.name == AUTHENTICATE {
            self.handle_authenticate(&message.body).await;
            return;
        }
        if !self.is_authenticated() {
            tracing::trace!(id = %self.id, name = %message.name, "discarding frame before authentication");
            return;
        }
        self.dispatch(message).await;
    }

    async fn dispatch(&self, message: Message) {
        if let Some(reply) = self.pending.lock().await.remove(&message.name) {
            let _ = reply.send(message.body.clone());
        }

        let mut listeners = self.listeners.lock().await;
        if let Some(subscribers) = listeners.get_mut(&message.name) {
            // Receivers that were dropped are pruned as we go.
            subscribers.retain(|tx| tx.send(message.body.clone()).is_ok());
            if subscribers.is_empty() {
                listeners.remove(&message.name);
            }
        }
    }

    async fn handle_authenticate(&self, body: &[Arg]) {
        let request = match body.first().map(Arg::parse::<AuthenticateRequest>) {
            Some(Ok(request)) => request,
            _ => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(id = %self.id, "dropping malformed authenticate message");
                return;
            }
        };

        // Only passport is client-driven; confirmation comes from the operator.
        if request.factor != Factor::Passport {
            tracing::debug!(id = %self.id, factor = %request.factor, "ignoring client-driven factor");
            return;
        }
        if let Err(e) = self.verify_passport(&request.passport_input).await {
            tracing::debug!(id = %self.id, error = %e, "passport not verified");
        }
    }

    /// Checks `input` against the passport verifier and signals the result.
    ///
    /// Returns whether the passport is verified. Once verified, further
    /// attempts are ignored and return `true`.
    async fn verify_passport(&self, input: &str) -> Result<bool, SessionError> {
        let passport = self
            .passport
            .as_ref()
            .ok_or(SessionError::PassportUnavailable)?;

        let (verified, signals) = {
            let mut state = self.state.lock().await;
            let factors = &mut state.factors;
            if !factors.is_required(Factor::Passport) {
                return Err(SessionError::FactorNotRequired(Factor::Passport));
            }
            if factors.get(Factor::Passport).verified == Some(true) {
                return Ok(true);
            }

            let verified = passport.verify(input);
            factors.record(Factor::Passport, verified);
            let mut signals = vec![AuthenticationSignal::factor_result(
                Factor::Passport,
                verified,
            )];
            if verified {
                if let Some(next) = factors.next_ask() {
                    signals.push(self.ask_signal(next));
                }
            }
            self.collect_aggregate(factors, &mut signals);
            (verified, signals)
        };

        tracing::info!(id = %self.id, verified, "passport checked");
        self.deliver(signals).await;
        Ok(verified)
    }

    /// Records the operator's decision for the confirmation factor.
    ///
    /// # Errors
    /// [`SessionError::FactorNotRequired`] if confirmation isn't required.
    pub async fn confirm(&self, allow: bool) -> Result<(), SessionError> {
        let signals = {
            let mut state = self.state.lock().await;
            let factors = &mut state.factors;
            if !factors.is_required(Factor::Confirmation) {
                return Err(SessionError::FactorNotRequired(Factor::Confirmation));
            }
            factors.record(Factor::Confirmation, allow);
            let mut signals = vec![AuthenticationSignal::factor_result(
                Factor::Confirmation,
                allow,
            )];
            self.collect_aggregate(factors, &mut signals);
            signals
        };

        tracing::info!(id = %self.id, allow, "confirmation decided");
        self.deliver(signals).await;
        Ok(())
    }

    fn collect_aggregate(&self, factors: &mut AuthFactors, signals: &mut Vec<AuthenticationSignal>) {
        self.authenticated
            .store(factors.is_authenticated(), Ordering::SeqCst);
        if let Some(value) = factors.take_aggregate_change() {
            signals.push(AuthenticationSignal::aggregate(value, Some(self.id.clone())));
        }
    }

    fn ask_signal(&self, factor: Factor) -> AuthenticationSignal {
        let kind = match factor {
            Factor::Passport => self.passport.as_ref().map(|p| p.kind().to_string()),
            Factor::Confirmation => None,
        };
        AuthenticationSignal::ask(factor, kind)
    }

    /// Sends authentication signals in order, then closes the socket if
    /// one of them was an aggregate deny.
    async fn deliver(&self, signals: Vec<AuthenticationSignal>) {
        let mut denied = false;
        for signal in signals {
            denied |= signal.is_aggregate_deny();
            let body = match Arg::json(&signal) {
                Ok(arg) => vec![arg],
                Err(e) => {
                    tracing::error!(id = %self.id, error = %e, "failed to encode signal");
                    continue;
                }
            };
            if let Err(e) = self.send_raw(AUTHENTICATION, body, false).await {
                tracing::debug!(id = %self.id, error = %e, "failed to send signal");
            }
            let _ = self.events.send(ConnectionEvent::Authentication(signal));
        }

        if denied {
            tracing::info!(id = %self.id, "authentication denied");
            self.disconnect(close_code::UNAUTHENTICATED, "unauthenticated")
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Sends `[name, body]` as a text frame.
    ///
    /// # Errors
    /// - [`SessionError::Disconnected`] without an open socket.
    /// - [`SessionError::NotAuthenticated`] before authentication.
    /// - Transport and encoding failures.
    pub async fn send(&self, name: &str, body: Vec<Arg>) -> Result<(), SessionError> {
        self.ensure_ready()?;
        self.send_raw(name, body, false).await
    }

    /// Same as [`Connection::send`], but as a binary frame.
    pub async fn send_binary(&self, name: &str, body: Vec<Arg>) -> Result<(), SessionError> {
        self.ensure_ready()?;
        self.send_raw(name, body, true).await
    }

    /// Sends a message and waits for the next inbound message with the
    /// same name, returning its body.
    ///
    /// Only one request per name can be pending; a newer one replaces the
    /// older, which then fails with [`SessionError::ReplyDropped`].
    ///
    /// # Errors
    /// Those of [`Connection::send`], plus [`SessionError::ReplyTimeout`]
    /// and [`SessionError::ReplyDropped`].
    pub async fn request(&self, name: &str, body: Vec<Arg>) -> Result<Vec<Arg>, SessionError> {
        self.ensure_ready()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(name.to_string(), tx);
        if let Err(e) = self.send_raw(name, body, false).await {
            self.prune_pending(name).await;
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::ReplyDropped {
                id: self.id.clone(),
                name: name.to_string(),
            }),
            Err(_) => {
                self.prune_pending(name).await;
                Err(SessionError::ReplyTimeout {
                    id: self.id.clone(),
                    name: name.to_string(),
                })
            }
        }
    }

    /// Removes the pending reply for `name` if its requester is gone,
    /// leaving a newer request under the same name alone.
    async fn prune_pending(&self, name: &str) {
        let mut pending = self.pending.lock().await;
        if pending.get(name).is_some_and(|tx| tx.is_closed()) {
            pending.remove(name);
        }
    }

    /// Receives the body of every inbound message named `name` that
    /// arrives after authentication.
    ///
    /// Dropping the receiver unsubscribes.
    pub async fn subscribe(&self, name: &str) -> mpsc::UnboundedReceiver<Vec<Arg>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Closes the current socket with `code` and stops reading it.
    ///
    /// Immediate and idempotent. `Disconnected` is emitted right away,
    /// without waiting for the client to acknowledge the close, so the
    /// grace period starts even if the client never answers.
    pub async fn disconnect(&self, code: u16, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let (socket, generation) = {
            let mut state = self.state.lock().await;
            // Not an abort: this may run on the reader task itself.
            if let Some(stop) = state.stop.take() {
                let _ = stop.send(());
            }
            (Arc::clone(&state.socket), state.generation)
        };
        if let Err(e) = socket.close(code, reason).await {
            tracing::debug!(id = %self.id, error = %e, "close failed");
        }
        self.handle_close(generation).await;
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Disconnected(self.id.clone()));
        }
        if !self.is_authenticated() {
            return Err(SessionError::NotAuthenticated(self.id.clone()));
        }
        Ok(())
    }

    async fn send_raw(&self, name: &str, body: Vec<Arg>, binary: bool) -> Result<(), SessionError> {
        let frame = self.codec.encode_frame(&Message::new(name, body), binary)?;
        let socket = Arc::clone(&self.state.lock().await.socket);
        socket.send(frame).await?;
        Ok(())
    }
}

impl<S: Socket> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}
