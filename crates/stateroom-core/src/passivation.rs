//! Passivation store — the persist/restore bridge for evicted sessions.
//!
//! An eviction pass serializes idle instances out of memory as a single
//! batch; a later `obtain` pulls them back in. [`PassivationStore`] is the
//! narrow contract the pool consumes. Two implementations ship in-crate:
//!
//! - [`MemoryStore`] — mutex-guarded map, take-once restore. The default for
//!   tests and embedders that only want overflow behavior, not durability.
//! - [`JsonFileStore`] — one JSON file per session key under a directory;
//!   the filesystem-backed default strategy.
//!
//! Restore is consuming in both: a record exists in memory or in the store,
//! never both.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::session::SessionKey;

/// File extension for persisted session records.
const RECORD_EXT: &str = "session";

/// A session evicted from memory: the component instance plus the activity
/// timestamp its expiry is computed from.
///
/// The timestamp travels with the record so a session that expires *while
/// persisted* can be detected at restore time without ever deserializing
/// back into the live index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassivatedSession<C> {
    /// The serialized-out component instance.
    pub instance: C,
    /// Last time the session was returned to the idle queue.
    pub last_activity: SystemTime,
}

/// Persist/restore contract consumed by the instance pool.
///
/// Implementations must be safe to call concurrently with unrelated session
/// operations; the pool never holds its own lock across these calls.
pub trait PassivationStore<C>: Send + Sync {
    /// Persist a batch of evicted sessions as one unit.
    ///
    /// The pool issues at most one call per eviction pass; implementations
    /// should treat the batch atomically where the medium allows it.
    fn passivate_batch(
        &self,
        batch: Vec<(SessionKey, PassivatedSession<C>)>,
    ) -> Result<(), StoreError>;

    /// Remove and return the record for `key`, or `None` if absent.
    fn restore(&self, key: &SessionKey) -> Result<Option<PassivatedSession<C>>, StoreError>;
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-process passivation store backed by a mutex-guarded map.
pub struct MemoryStore<C> {
    slots: Mutex<HashMap<SessionKey, PassivatedSession<C>>>,
}

impl<C> Default for MemoryStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MemoryStore<C> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Number of persisted records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, PassivatedSession<C>>> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<C: Send> PassivationStore<C> for MemoryStore<C> {
    fn passivate_batch(
        &self,
        batch: Vec<(SessionKey, PassivatedSession<C>)>,
    ) -> Result<(), StoreError> {
        let mut slots = self.lock();
        for (key, record) in batch {
            slots.insert(key, record);
        }
        Ok(())
    }

    fn restore(&self, key: &SessionKey) -> Result<Option<PassivatedSession<C>>, StoreError> {
        Ok(self.lock().remove(key))
    }
}

// =============================================================================
// JsonFileStore
// =============================================================================

/// Filesystem-backed passivation store: one JSON record per session key.
///
/// Keys are hex-encoded into filenames, so arbitrary key strings are safe.
/// Restore deletes the record file, preserving the exists-in-exactly-one-place
/// invariant.
pub struct JsonFileStore<C> {
    dir: PathBuf,
    _component: PhantomData<fn() -> C>,
}

impl<C> JsonFileStore<C> {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            _component: PhantomData,
        })
    }

    /// Directory holding the record files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &SessionKey) -> PathBuf {
        let encoded = hex::encode(key.as_str().as_bytes());
        self.dir.join(format!("{encoded}.{RECORD_EXT}"))
    }
}

impl<C> PassivationStore<C> for JsonFileStore<C>
where
    C: Serialize + DeserializeOwned + Send,
{
    fn passivate_batch(
        &self,
        batch: Vec<(SessionKey, PassivatedSession<C>)>,
    ) -> Result<(), StoreError> {
        for (key, record) in batch {
            let bytes = serde_json::to_vec(&record)?;
            let path = self.record_path(&key);
            std::fs::write(&path, bytes)?;
            debug!(session = %key, path = %path.display(), "session record written");
        }
        Ok(())
    }

    fn restore(&self, key: &SessionKey) -> Result<Option<PassivatedSession<C>>, StoreError> {
        let path = self.record_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record: PassivatedSession<C> = serde_json::from_slice(&bytes)?;
        std::fs::remove_file(&path)?;
        debug!(session = %key, "session record restored and removed");
        Ok(Some(record))
    }
}
