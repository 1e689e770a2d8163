//! Append-only log of failed jobs and provider fetches.
//!
//! Each failure is one JSON line, so a later run can replay the failed jobs
//! with `REPROCESS_FAILED=true`. Every event is mirrored to tracing under the
//! `carecrawl::failed` target, which the critical log layer picks up.
use crate::error::{CrawlError, ErrorKind};
use crate::job::Job;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    io,
    path::{Path, PathBuf},
};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::{error, warn};
use uuid::Uuid;

pub const FAILED_TARGET: &str = "carecrawl::failed";

/// Events kept in memory; older ones only live in the file.
pub const RECENT_EVENTS: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    pub job: Job,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Default)]
struct Recorded {
    recent: VecDeque<FailureEvent>,
    by_kind: BTreeMap<ErrorKind, usize>,
    total: usize,
}

#[derive(Debug)]
pub struct FailureLog {
    run_id: Uuid,
    path: Option<PathBuf>,
    // Serializes appends and keeps counters plus the most recent events.
    recorded: Mutex<Recorded>,
}

impl FailureLog {
    /// Log appending to `path`; parent directories are created on demand.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            path: Some(path.into()),
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// Log that only keeps events in memory.
    pub fn in_memory() -> Self {
        Self {
            run_id: Uuid::now_v7(),
            path: None,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn record_job(&self, job: &Job, page: Option<u32>, err: &CrawlError) {
        self.record(job, None, page, err.kind(), err.attempts(), err.to_string())
            .await;
    }

    pub async fn record_provider(&self, job: &Job, provider_id: &str, err: &CrawlError) {
        self.record(
            job,
            Some(provider_id.to_string()),
            None,
            err.kind(),
            err.attempts(),
            err.to_string(),
        )
        .await;
    }

    pub async fn record(
        &self,
        job: &Job,
        provider_id: Option<String>,
        page: Option<u32>,
        kind: ErrorKind,
        attempts: u32,
        message: String,
    ) {
        let event = FailureEvent {
            run_id: self.run_id,
            at: Utc::now(),
            job: job.clone(),
            provider_id,
            page,
            kind,
            attempts,
            message,
        };

        error!(
            target: FAILED_TARGET,
            job = %event.job,
            provider_id = event.provider_id.as_deref().unwrap_or("-"),
            page = event.page.unwrap_or(0),
            kind = %event.kind,
            attempts = event.attempts,
            "{}",
            event.message
        );

        let mut recorded = self.recorded.lock().await;
        if let Some(path) = &self.path {
            // A broken failure log must not take the run down with it.
            if let Err(e) = append_line(path, &event).await {
                warn!("Failed to append to {}: {e}", path.display());
            }
        }
        recorded.total += 1;
        *recorded.by_kind.entry(event.kind).or_default() += 1;
        if recorded.recent.len() == RECENT_EVENTS {
            recorded.recent.pop_front();
        }
        recorded.recent.push_back(event);
    }

    /// Up to [`RECENT_EVENTS`] latest events, oldest first.
    pub async fn events(&self) -> Vec<FailureEvent> {
        self.recorded.lock().await.recent.iter().cloned().collect()
    }

    pub async fn counts(&self) -> BTreeMap<ErrorKind, usize> {
        self.recorded.lock().await.by_kind.clone()
    }

    /// Events recorded this run, including ones no longer in memory.
    pub async fn len(&self) -> usize {
        self.recorded.lock().await.total
    }

    pub async fn is_empty(&self) -> bool {
        self.recorded.lock().await.total == 0
    }

    /// Distinct jobs from a previous log, in first-seen order. Unparseable
    /// lines are skipped with a warning.
    pub fn read_jobs(path: impl AsRef<Path>) -> io::Result<Vec<Job>> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FailureEvent>(line) {
                Ok(event) => {
                    if seen.insert(event.job.cache_key()) {
                        jobs.push(event.job);
                    }
                }
                Err(e) => warn!(
                    "Skipping line {} of {}: {e}",
                    idx + 1,
                    path.as_ref().display()
                ),
            }
        }
        Ok(jobs)
    }
}

async fn append_line(path: &Path, event: &FailureEvent) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(&line).await?;
    file.flush().await
}
