//! Artifact persistence for listing pages and provider details.
use crate::error::SinkError;
use crate::job::Job;
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Receives raw payloads. `Ok` means the artifact is fully written.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn persist_listing(&self, job: &Job, page: u32, payload: &Value) -> Result<(), SinkError>;

    async fn persist_detail(&self, provider_id: &str, payload: &Value) -> Result<(), SinkError>;
}

/// Percent-escape one file name component. `_` separates components, so it
/// is escaped as well and distinct inputs never share a name.
fn sanitize(part: &str) -> String {
    urlencoding::encode(part).replace('_', "%5F")
}

pub fn listing_file_name(job: &Job, page: u32) -> String {
    format!(
        "raw_results_{}_{}_{}_{}_{}_page_{}.json",
        sanitize(&job.specialty),
        job.service_type.as_str(),
        sanitize(&job.zip_code),
        sanitize(&job.plan.plan_type),
        sanitize(&job.plan.network_code),
        page
    )
}

pub fn detail_file_name(provider_id: &str) -> String {
    format!("raw_results_{}.json", sanitize(provider_id))
}

/// Pretty JSON files under `<root>/listing` and `<root>/detail`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    root: PathBuf,
}

impl JsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn listing_dir(&self) -> PathBuf {
        self.root.join("listing")
    }

    pub fn detail_dir(&self) -> PathBuf {
        self.root.join("detail")
    }

    async fn write_atomic(dir: &Path, name: &str, payload: &Value) -> Result<(), SinkError> {
        tokio::fs::create_dir_all(dir).await?;
        let bytes = serde_json::to_vec_pretty(payload)?;
        let target = dir.join(name);
        let tmp = dir.join(format!(".{name}.{}.tmp", uuid::Uuid::now_v7()));

        if let Err(e) = Self::write_synced(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("Saved {}", target.display());
        Ok(())
    }

    // On disk before the rename; callers mark the key seen right after.
    async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
}

#[async_trait]
impl ArtifactSink for JsonFileSink {
    async fn persist_listing(&self, job: &Job, page: u32, payload: &Value) -> Result<(), SinkError> {
        Self::write_atomic(&self.listing_dir(), &listing_file_name(job, page), payload).await
    }

    async fn persist_detail(&self, provider_id: &str, payload: &Value) -> Result<(), SinkError> {
        Self::write_atomic(&self.detail_dir(), &detail_file_name(provider_id), payload).await
    }
}

/// In-memory sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    listings: Mutex<BTreeMap<String, Value>>,
    details: Mutex<BTreeMap<String, Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listing artifact names in sorted order.
    pub fn listing_names(&self) -> Vec<String> {
        self.listings
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn detail_ids(&self) -> Vec<String> {
        self.details
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn listing(&self, job: &Job, page: u32) -> Option<Value> {
        self.listings
            .lock()
            .ok()
            .and_then(|m| m.get(&listing_file_name(job, page)).cloned())
    }
}

fn poisoned() -> SinkError {
    SinkError::Io(std::io::Error::other("memory sink lock poisoned"))
}

#[async_trait]
impl ArtifactSink for MemorySink {
    async fn persist_listing(&self, job: &Job, page: u32, payload: &Value) -> Result<(), SinkError> {
        self.listings
            .lock()
            .map_err(|_| poisoned())?
            .insert(listing_file_name(job, page), payload.clone());
        Ok(())
    }

    async fn persist_detail(&self, provider_id: &str, payload: &Value) -> Result<(), SinkError> {
        self.details
            .lock()
            .map_err(|_| poisoned())?
            .insert(provider_id.to_string(), payload.clone());
        Ok(())
    }
}
