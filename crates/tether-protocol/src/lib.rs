//! Wire protocol for Tether.
//!
//! This crate defines the "language" clients and the server speak:
//!
//! - **Types** ([`Message`], [`Arg`], [`ConnectionId`], [`ActivityId`]):
//!   the `[name, body]` frame and what goes inside it.
//! - **Control** ([`AuthenticationSignal`], [`AuthenticateRequest`],
//!   [`NewActivity`], close codes): the framework's reserved messages.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how messages become
//!   transport frames and back.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (frames) → Protocol (Message) → Session (Connection)
//! ```

mod codec;
mod control;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use control::{
    AUTHENTICATE, AUTHENTICATION, ActivityStatus, AuthStatus, AuthenticateRequest,
    AuthenticationSignal, Factor, NEW_ACTIVITY, NewActivity, PREVIOUS_CONNECTION_ID, close_code,
};
pub use error::ProtocolError;
pub use types::{ActivityId, Arg, BYTES_TAG, ConnectionId, Message};
