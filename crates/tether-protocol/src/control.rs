//! Control messages used by the framework itself.
//!
//! Three reserved event names carry framework traffic:
//!
//! | name | direction | payload |
//! |---|---|---|
//! | `authentication` | server → client | [`AuthenticationSignal`] |
//! | `authenticate` | client → server | [`AuthenticateRequest`] |
//! | `newActivity` | both | [`NewActivity`] |
//!
//! Each payload travels as the single element of the message body.

use serde::{Deserialize, Serialize};

use crate::{ActivityId, ConnectionId};

/// Server → client authentication progress.
pub const AUTHENTICATION: &str = "authentication";
/// Client → server credential submission.
pub const AUTHENTICATE: &str = "authenticate";
/// Activity control channel.
pub const NEW_ACTIVITY: &str = "newActivity";

/// Query parameter a reconnecting client puts on its upgrade request.
pub const PREVIOUS_CONNECTION_ID: &str = "previousConnectionId";

/// Application close codes.
pub mod close_code {
    /// Authentication was denied.
    pub const UNAUTHENTICATED: u16 = 4000;
    /// A reconnect referenced a connection that does not exist (any more).
    pub const UNKNOWN_CONNECTION: u16 = 4001;
    /// A reconnect referenced a connection that is still connected.
    pub const ALREADY_CONNECTED: u16 = 4002;
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// An authentication factor, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Factor {
    /// Credential checked by the passport verifier.
    Passport,
    /// Explicit approval by the operator.
    Confirmation,
}

impl Factor {
    /// All factors in the fixed order they are evaluated.
    pub const ORDER: [Factor; 2] = [Factor::Passport, Factor::Confirmation];

    /// Returns the wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passport => "passport",
            Self::Confirmation => "confirmation",
        }
    }
}

impl std::fmt::Display for Factor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status carried by an [`AuthenticationSignal`].
///
/// Serialized as the bare numbers `0`, `1`, `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AuthStatus {
    /// The client is asked to provide (or wait for) this factor.
    Ask,
    /// The factor, or the connection as a whole, is authenticated.
    Allow,
    /// The factor, or the connection as a whole, is denied.
    Deny,
}

impl From<AuthStatus> for u8 {
    fn from(status: AuthStatus) -> Self {
        match status {
            AuthStatus::Ask => 0,
            AuthStatus::Allow => 1,
            AuthStatus::Deny => 2,
        }
    }
}

impl TryFrom<u8> for AuthStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ask),
            1 => Ok(Self::Allow),
            2 => Ok(Self::Deny),
            other => Err(format!("unknown authentication status {other}")),
        }
    }
}

impl AuthStatus {
    /// Maps a verification result to allow/deny.
    pub fn from_verified(verified: bool) -> Self {
        if verified { Self::Allow } else { Self::Deny }
    }
}

/// `authentication` payload.
///
/// Without `factor` it reports the aggregate state of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationSignal {
    /// Factor this signal is about; `None` for the aggregate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<Factor>,
    /// Ask / allow / deny.
    pub status: AuthStatus,
    /// Credential type hint, sent with the passport ask.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Connection id, sent with the aggregate allow so the client can
    /// resume the session after a network drop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ConnectionId>,
}

impl AuthenticationSignal {
    /// Asks for a factor.
    pub fn ask(factor: Factor, kind: Option<String>) -> Self {
        Self {
            factor: Some(factor),
            status: AuthStatus::Ask,
            kind,
            id: None,
        }
    }

    /// Reports the verification result of one factor.
    pub fn factor_result(factor: Factor, verified: bool) -> Self {
        Self {
            factor: Some(factor),
            status: AuthStatus::from_verified(verified),
            kind: None,
            id: None,
        }
    }

    /// Reports the aggregate state.
    pub fn aggregate(authenticated: bool, id: Option<ConnectionId>) -> Self {
        Self {
            factor: None,
            status: AuthStatus::from_verified(authenticated),
            kind: None,
            id: if authenticated { id } else { None },
        }
    }

    /// Returns `true` for an aggregate deny.
    pub fn is_aggregate_deny(&self) -> bool {
        self.factor.is_none() && self.status == AuthStatus::Deny
    }
}

/// `authenticate` payload. Only the passport factor is client-driven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    /// Factor being answered.
    pub factor: Factor,
    /// The credential.
    #[serde(default)]
    pub passport_input: String,
}

// ---------------------------------------------------------------------------
// Activity control channel
// ---------------------------------------------------------------------------

/// Status of a `newActivity` message.
///
/// As a request: open / start / close. As a reply: opened / started /
/// closed-or-failed (a failure additionally carries `error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ActivityStatus {
    /// `0`
    Open,
    /// `1`
    Start,
    /// `2`
    Close,
}

impl From<ActivityStatus> for u8 {
    fn from(status: ActivityStatus) -> Self {
        match status {
            ActivityStatus::Open => 0,
            ActivityStatus::Start => 1,
            ActivityStatus::Close => 2,
        }
    }
}

impl TryFrom<u8> for ActivityStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Open),
            1 => Ok(Self::Start),
            2 => Ok(Self::Close),
            other => Err(format!("unknown activity status {other}")),
        }
    }
}

/// `newActivity` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewActivity {
    /// Request or reply status.
    pub status: ActivityStatus,
    /// Activity id; absent on an open request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ActivityId>,
    /// Plugin type name.
    #[serde(default)]
    pub plugin: String,
    /// Failure description on error replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NewActivity {
    /// Successful reply.
    pub fn reply(status: ActivityStatus, id: ActivityId, plugin: impl Into<String>) -> Self {
        Self {
            status,
            id: Some(id),
            plugin: plugin.into(),
            error: None,
        }
    }

    /// Error reply. Always carries status `2`.
    pub fn failure(
        id: Option<ActivityId>,
        plugin: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: ActivityStatus::Close,
            id,
            plugin: plugin.into(),
            error: Some(error.into()),
        }
    }
}
