//! Persistent "seen" markers for crawl work.
//!
//! Entries are keys only: a present key means the job or provider it names
//! was completed by some earlier run. Backends:
//! - [`FjallDedupCache`]: on-disk LSM store, survives restarts (default)
//! - [`InMemoryDedupCache`]: process-local, for tests and dry runs
pub mod backend;
mod error;

pub use crate::backend::{FjallDedupCache, InMemoryDedupCache};
pub use crate::error::CacheError;

use async_trait::async_trait;
use std::fmt;

/// Deterministic cache key derived from a job or a provider identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// `namespace:part1:part2:...`
    pub fn namespaced<I, S>(namespace: &str, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut key = namespace.to_string();
        for part in parts {
            key.push(':');
            key.push_str(part.as_ref());
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Set of completed work items.
///
/// `put` returns only once the marker is durable. Writers are serialized
/// inside the backend; reads may run concurrently.
#[async_trait]
pub trait DedupCache: Send + Sync {
    async fn has(&self, key: &CacheKey) -> Result<bool, CacheError>;

    async fn put(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Drop every marker.
    async fn clear(&self) -> Result<(), CacheError>;

    async fn len(&self) -> Result<usize, CacheError>;

    async fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len().await? == 0)
    }

    /// Flush pending writes to durable storage.
    async fn flush(&self) -> Result<(), CacheError>;

    /// Flush and release the store. Later calls fail with
    /// [`CacheError::Closed`]; closing twice is a no-op.
    async fn close(&self) -> Result<(), CacheError>;
}
