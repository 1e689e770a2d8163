use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{CacheError, CacheKey, DedupCache};

/// Fjall-backed dedup cache (default backend).
///
/// Layout:
/// - `seen`: cache key bytes -> empty value
pub struct FjallDedupCache {
    path: PathBuf,
    db: Keyspace,
    seen: PartitionHandle,
    // Single writer: put/clear/close never interleave.
    lock: Mutex<()>,
    closed: AtomicBool,
}

impl FjallDedupCache {
    /// Open (or create) the store at `path`, creating missing directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let keyspace = Config::new(&path).open()?;
        let seen = keyspace.open_partition("seen", PartitionCreateOptions::default())?;
        tracing::debug!("Dedup cache opened at {}", path.display());

        Ok(Self {
            path,
            db: keyspace,
            seen,
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl DedupCache for FjallDedupCache {
    async fn has(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.ensure_open()?;
        Ok(self.seen.contains_key(key.as_bytes())?)
    }

    async fn put(&self, key: &CacheKey) -> Result<(), CacheError> {
        let _guard = self.lock.lock()?;
        self.ensure_open()?;

        self.seen.insert(key.as_bytes(), &[] as &[u8])?;
        // Marker must survive a crash right after this returns.
        self.db.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let _guard = self.lock.lock()?;
        self.ensure_open()?;

        let keys = self.seen.keys().collect::<Result<Vec<_>, _>>()?;
        let removed = keys.len();
        for key in keys {
            self.seen.remove(key)?;
        }
        self.db.persist(PersistMode::SyncAll)?;
        tracing::info!("Dedup cache cleared ({removed} markers)");
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        self.ensure_open()?;
        Ok(self.seen.len()?)
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let _guard = self.lock.lock()?;
        self.ensure_open()?;
        self.db.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        let _guard = self.lock.lock()?;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.db.persist(PersistMode::SyncAll)?;
        tracing::debug!("Dedup cache closed at {}", self.path.display());
        Ok(())
    }
}

impl Drop for FjallDedupCache {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.db.persist(PersistMode::SyncAll) {
                tracing::error!("Failed to persist dedup cache on drop: {e}");
            }
        }
    }
}

impl std::fmt::Debug for FjallDedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FjallDedupCache")
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
