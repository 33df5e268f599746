//! Session persistence.
//!
//! [`SessionRepository`] is the storage seam: the session service never
//! touches a global map. Two backends ship: an in-memory map for tests and
//! single-process use, and a JSON file holding one `{ sessionId: Session }`
//! object.

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;
use crate::types::{Session, SessionId, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, RwLock};

/// Keyed storage for checkout sessions
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Loads a session
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend cannot be read.
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StorageError>;

    /// Inserts or replaces a session
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend cannot be written.
    async fn put(&self, session: &Session) -> Result<(), StorageError>;

    /// Deletes a session, returning whether it existed
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend cannot be written.
    async fn delete(&self, id: &SessionId) -> Result<bool, StorageError>;

    /// Deletes unpaid sessions whose deadline passed before `cutoff`,
    /// returning their ids
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend cannot be written.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>, StorageError>;
}

/// Builds the repository selected by configuration
#[must_use]
pub fn repository_from_config(config: &StorageConfig) -> Arc<dyn SessionRepository> {
    match config.backend {
        StorageBackend::Memory => Arc::new(InMemorySessionRepository::new()),
        StorageBackend::File => Arc::new(FileSessionRepository::new(config.path.clone())),
    }
}

/// Sessions kept in a process-local map
#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl InMemorySessionRepository {
    /// Empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// True when nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StorageError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn put(&self, session: &Session) -> Result<(), StorageError> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StorageError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>, StorageError> {
        let mut sessions = self.sessions.write().await;
        let purged = purgeable(&sessions, cutoff);
        for id in &purged {
            sessions.remove(id);
        }
        Ok(purged)
    }
}

type SessionMap = HashMap<SessionId, Session>;

/// Sessions kept in one JSON file
///
/// Each call holds an exclusive advisory lock on a sibling `<file>.lock`
/// for its whole load, change and store cycle, so several repositories (or
/// processes) sharing the file never overwrite each other. Writes go
/// through a uniquely named temp file in the same directory followed by a
/// rename, so readers never see a half-written map. A missing file reads as
/// an empty map.
#[derive(Debug)]
pub struct FileSessionRepository {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionRepository {
    /// Repository backed by the file at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `change` on the stored map under the file lock
    ///
    /// The map is written back only when `change` reports it dirty.
    async fn with_map<T, F>(&self, change: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SessionMap) -> (T, bool) + Send + 'static,
        T: Send + 'static,
    {
        // One blocking thread per repository at a time
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || locked_cycle(&path, change)).await?
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

fn locked_cycle<T, F>(path: &Path, change: F) -> Result<T, StorageError>
where
    F: FnOnce(&mut SessionMap) -> (T, bool),
{
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    FileExt::lock_exclusive(&lock_file)?;

    let result = read_map(path).and_then(|mut sessions| {
        let (value, dirty) = change(&mut sessions);
        if dirty {
            write_map(dir, path, &sessions)?;
        }
        Ok(value)
    });

    if let Err(err) = FileExt::unlock(&lock_file) {
        tracing::warn!(path = %path.display(), error = %err, "Failed to release session file lock");
    }
    result
}

fn read_map(path: &Path) -> Result<SessionMap, StorageError> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(SessionMap::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SessionMap::new()),
        Err(err) => Err(err.into()),
    }
}

fn write_map(dir: &Path, path: &Path, sessions: &SessionMap) -> Result<(), StorageError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), sessions)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[async_trait]
impl SessionRepository for FileSessionRepository {
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StorageError> {
        let id = *id;
        self.with_map(move |sessions| (sessions.remove(&id), false)).await
    }

    async fn put(&self, session: &Session) -> Result<(), StorageError> {
        let session = session.clone();
        self.with_map(move |sessions| {
            sessions.insert(session.id, session);
            ((), true)
        })
        .await
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StorageError> {
        let id = *id;
        self.with_map(move |sessions| {
            let existed = sessions.remove(&id).is_some();
            (existed, existed)
        })
        .await
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>, StorageError> {
        self.with_map(move |sessions| {
            let purged = purgeable(sessions, cutoff);
            for id in &purged {
                sessions.remove(id);
            }
            let dirty = !purged.is_empty();
            (purged, dirty)
        })
        .await
    }
}

/// Unpaid sessions whose deadline passed before `cutoff`
fn purgeable(sessions: &SessionMap, cutoff: DateTime<Utc>) -> Vec<SessionId> {
    sessions
        .values()
        .filter(|s| s.status != SessionStatus::PaymentSucceeded && s.expires_at <= cutoff)
        .map(|s| s.id)
        .collect()
}
