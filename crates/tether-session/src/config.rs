//! Manager-level settings and where they are persisted.
//!
//! The settings document is a small JSON object:
//!
//! ```json
//! {
//!   "authenticationFactors": { "confirmation": true, "passport": false },
//!   "passport": null,
//!   "removeTimeout": 30000,
//!   "requestTimeout": 30000
//! }
//! ```
//!
//! Missing keys fall back to their defaults, so an empty `{}` is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{FactorConfig, PassportRecord, SessionError};

/// Default grace period before a disconnected connection is evicted.
pub const DEFAULT_REMOVE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default wait for a request's reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Settings shared by every connection in a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionsConfig {
    pub authentication_factors: FactorConfig,
    pub passport: Option<PassportRecord>,
    /// Grace period in milliseconds.
    pub remove_timeout: u64,
    /// Reply timeout in milliseconds.
    pub request_timeout: u64,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            authentication_factors: FactorConfig::default(),
            passport: None,
            remove_timeout: DEFAULT_REMOVE_TIMEOUT.as_millis() as u64,
            request_timeout: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ConnectionsConfig {
    pub fn remove_timeout(&self) -> Duration {
        Duration::from_millis(self.remove_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Somewhere to load and save [`ConnectionsConfig`].
///
/// Calls are synchronous and happen rarely (startup and operator changes),
/// so implementations may block briefly.
pub trait SettingsStore: Send + Sync + 'static {
    /// Loads the stored settings. `Ok(None)` if nothing is stored yet.
    fn load(&self) -> Result<Option<ConnectionsConfig>, SessionError>;

    /// Replaces the stored settings.
    fn save(&self, config: &ConnectionsConfig) -> Result<(), SessionError>;
}

/// Stores settings as pretty-printed JSON in one file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SessionError {
        SessionError::SettingsIo {
            path: self.path.clone(),
            source,
        }
    }

    fn format_error(&self, source: serde_json::Error) -> SessionError {
        SessionError::SettingsFormat {
            path: self.path.clone(),
            source,
        }
    }
}

impl SettingsStore for JsonFileStore {
    fn load(&self) -> Result<Option<ConnectionsConfig>, SessionError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| self.format_error(e))
    }

    fn save(&self, config: &ConnectionsConfig) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json = serde_json::to_string_pretty(config).map_err(|e| self.format_error(e))?;
        std::fs::write(&self.path, json).map_err(|e| self.io_error(e))
    }
}
