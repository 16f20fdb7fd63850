//! Credential verification for the passport factor.
//!
//! Tether doesn't decide how secrets are stored; it only needs something
//! that can answer "does this input match?". That is the [`Passport`]
//! trait. [`SaltedPassport`] is the implementation the connection manager
//! persists: a salted SHA-256 digest, kept as a [`PassportRecord`]
//! (`{type, hash, salt}`) in the settings file.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::SessionError;

/// Verifies client-supplied credentials for the passport factor.
///
/// # Trait bounds
///
/// `Send + Sync + 'static` because one verifier is shared by every
/// connection the manager creates, across Tokio worker threads.
///
/// # Example
///
/// ```rust
/// use tether_session::Passport;
///
/// /// Accepts a fixed PIN. Only for development.
/// struct PinPassport(&'static str);
///
/// impl Passport for PinPassport {
///     fn kind(&self) -> &str {
///         "pin"
///     }
///
///     fn verify(&self, input: &str) -> bool {
///         input == self.0
///     }
/// }
/// ```
pub trait Passport: Send + Sync + 'static {
    /// Type tag sent to the client with the passport ask, so it knows
    /// what kind of credential to prompt for.
    fn kind(&self) -> &str;

    /// Returns `true` if `input` matches the stored secret.
    fn verify(&self, input: &str) -> bool;
}

/// Persisted form of a [`SaltedPassport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassportRecord {
    /// Hash type; only `"sha256"` is understood.
    #[serde(rename = "type")]
    pub kind: String,
    /// Lowercase hex digest of `salt || secret`.
    pub hash: String,
    /// Lowercase hex salt.
    pub salt: String,
}

/// A salted SHA-256 [`Passport`].
#[derive(Debug, Clone)]
pub struct SaltedPassport {
    record: PassportRecord,
}

impl SaltedPassport {
    /// Type tag of this passport.
    pub const KIND: &'static str = "sha256";

    /// Hashes `secret` with a fresh random 16-byte salt.
    pub fn generate(secret: &str) -> Self {
        let salt_bytes: [u8; 16] = rand::rng().random();
        let salt = hex::encode(salt_bytes);
        let hash = hex::encode(digest(&salt, secret));
        Self {
            record: PassportRecord {
                kind: Self::KIND.to_string(),
                hash,
                salt,
            },
        }
    }

    /// Rebuilds a passport from its persisted record.
    ///
    /// # Errors
    /// [`SessionError::UnsupportedPassport`] for any type other than
    /// `"sha256"`.
    pub fn from_record(record: PassportRecord) -> Result<Self, SessionError> {
        if record.kind != Self::KIND {
            return Err(SessionError::UnsupportedPassport(record.kind));
        }
        Ok(Self { record })
    }

    /// Returns the record to persist.
    pub fn record(&self) -> &PassportRecord {
        &self.record
    }
}

impl Passport for SaltedPassport {
    fn kind(&self) -> &str {
        &self.record.kind
    }

    fn verify(&self, input: &str) -> bool {
        let Ok(stored) = hex::decode(&self.record.hash) else {
            return false;
        };
        let candidate = digest(&self.record.salt, input);
        candidate.as_slice().ct_eq(&stored).into()
    }
}

fn digest(salt: &str, secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}
