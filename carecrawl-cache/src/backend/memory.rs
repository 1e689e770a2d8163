//! Process-local dedup cache. Nothing survives the process; `flush` and
//! `close` only flip state.
use crate::{CacheError, CacheKey, DedupCache};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    RwLock,
};

#[derive(Debug, Default)]
pub struct InMemoryDedupCache {
    seen: RwLock<HashSet<CacheKey>>,
    closed: AtomicBool,
}

impl InMemoryDedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated cache, handy for replaying a previous run.
    pub fn with_keys(keys: impl IntoIterator<Item = CacheKey>) -> Self {
        Self {
            seen: RwLock::new(keys.into_iter().collect()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl DedupCache for InMemoryDedupCache {
    async fn has(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.ensure_open()?;
        Ok(self.seen.read()?.contains(key))
    }

    async fn put(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.seen.write()?.insert(key.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.seen.write()?.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        self.ensure_open()?;
        Ok(self.seen.read()?.len())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
