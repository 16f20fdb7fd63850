//! Connection pools keyed by settings file.
//!
//! Two parts of an application that point at the same settings file must
//! share one [`Connections`] pool, or they would each hold their own view
//! of the persisted factors and passport. The registry lives at the
//! composition root and hands out that single pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tether_session::{Connections, JsonFileStore, SessionError};
use tether_transport::Socket;
use tokio::sync::Mutex;

/// Deduplicates [`Connections`] pools by settings path.
pub struct ManagerRegistry<S: Socket> {
    managers: Mutex<HashMap<PathBuf, Connections<S>>>,
}

impl<S: Socket> ManagerRegistry<S> {
    pub fn new() -> Self {
        Self {
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pool for `path`, loading it from the file on first use.
    ///
    /// Relative paths are resolved against the working directory, so
    /// `settings.json` and `./settings.json` share a pool.
    ///
    /// # Errors
    /// Whatever [`Connections::with_store`] reports for the file's
    /// contents. A failed load is not cached.
    pub async fn get_or_load(&self, path: impl AsRef<Path>) -> Result<Connections<S>, SessionError> {
        let key = normalize(path.as_ref());
        let mut managers = self.managers.lock().await;
        if let Some(connections) = managers.get(&key) {
            return Ok(connections.clone());
        }

        let connections = Connections::with_store(JsonFileStore::new(&key))?;
        tracing::info!(path = %key.display(), "connection pool loaded");
        managers.insert(key, connections.clone());
        Ok(connections)
    }

    pub async fn len(&self) -> usize {
        self.managers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<S: Socket> Default for ManagerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    // Drop `.` segments; `..` is left alone since it may cross a symlink.
    absolute
        .components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tether_protocol::Factor;
    use tether_session::FactorConfig;
    use tether_transport::memory::{self, MemorySocket};

    use super::*;

    #[tokio::test]
    async fn test_get_or_load_same_path_shares_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let registry = ManagerRegistry::<MemorySocket>::new();

        let first = registry.get_or_load(&path).await.unwrap();
        let second = registry.get_or_load(dir.path().join(".").join("settings.json")).await.unwrap();

        let (socket, _client) = memory::pair(None);
        let admitted = first.add(socket, &Default::default()).await.unwrap();
        let id = admitted.connection().unwrap().id().clone();

        assert!(second.find(&id).await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_or_load_different_paths_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ManagerRegistry::<MemorySocket>::new();

        let a = registry.get_or_load(dir.path().join("a.json")).await.unwrap();
        let b = registry.get_or_load(dir.path().join("b.json")).await.unwrap();
        a.set_remove_timeout(Duration::from_secs(5)).await.unwrap();

        assert_eq!(a.config().await.remove_timeout(), Duration::from_secs(5));
        assert_ne!(b.config().await.remove_timeout(), Duration::from_secs(5));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_get_or_load_reads_saved_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let writer = ManagerRegistry::<MemorySocket>::new();
        let pool = writer.get_or_load(&path).await.unwrap();
        pool.set_passport("hunter2").await.unwrap();
        pool.set_authentication_factors(FactorConfig {
            confirmation: false,
            passport: true,
        })
        .await
        .unwrap();

        let reader = ManagerRegistry::<MemorySocket>::new();
        let reloaded = reader.get_or_load(&path).await.unwrap();
        let config = reloaded.config().await;
        assert!(config.authentication_factors.requires(Factor::Passport));
        assert!(config.passport.is_some());
    }

    #[tokio::test]
    async fn test_get_or_load_bad_file_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let registry = ManagerRegistry::<MemorySocket>::new();

        let result = registry.get_or_load(&path).await;
        assert!(matches!(result, Err(SessionError::SettingsFormat { .. })));
        assert!(registry.is_empty().await);

        std::fs::write(&path, "{}").unwrap();
        assert!(registry.get_or_load(&path).await.is_ok());
    }
}
