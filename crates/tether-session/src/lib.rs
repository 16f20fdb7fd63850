//! Client connection management for Tether.
//!
//! This crate handles the lifecycle of client connections:
//!
//! 1. **Authentication**: a per-connection state machine over ordered
//!    factors ([`AuthFactors`]), with passport verification
//!    ([`Passport`]) and operator confirmation ([`Connection::confirm`]).
//! 2. **Messaging**: `[name, body]` send, request/reply, and subscription
//!    on one [`Connection`].
//! 3. **Pooling and reconnection**: [`Connections`] admits sockets,
//!    resumes dropped connections during a grace period, evicts the rest,
//!    and broadcasts.
//! 4. **Settings**: [`ConnectionsConfig`], persisted through a
//!    [`SettingsStore`] such as [`JsonFileStore`].
//!
//! # How it fits in the stack
//!
//! ```text
//! Activity Layer (above)  ← binds plugins to authenticated connections
//!     ↕
//! Session Layer (this crate)  ← identity, authentication, reconnection
//!     ↕
//! Protocol Layer (below)  ← Message, control payloads, codec
//! ```

mod config;
mod connection;
mod error;
mod factors;
mod manager;
mod passport;

pub use config::{
    ConnectionsConfig, DEFAULT_REMOVE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, JsonFileStore,
    SettingsStore,
};
pub use connection::{Connection, ConnectionEvent, ConnectionOptions, NORMAL_CLOSE};
pub use error::SessionError;
pub use factors::{AuthFactors, FactorConfig, FactorState};
pub use manager::{Admission, AdmissionHook, Connections, PoolEvent};
pub use passport::{Passport, PassportRecord, SaltedPassport};
