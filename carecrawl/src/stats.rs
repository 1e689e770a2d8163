use crate::error::ErrorKind;
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};

/// How one job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    /// Already marked seen by an earlier run.
    Skipped,
    /// Failure recorded in the failure log.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub pages_persisted: usize,
    pub details_persisted: usize,
}

impl JobOutcome {
    pub fn skipped() -> Self {
        Self {
            status: JobStatus::Skipped,
            pages_persisted: 0,
            details_persisted: 0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RunStats {
    pub jobs_total: usize,
    pub jobs_completed: usize,
    pub jobs_skipped: usize,
    pub jobs_failed: usize,
    pub pages_persisted: usize,
    pub details_persisted: usize,
    pub batches: usize,
    pub elapsed: Duration,
    /// Failure events by kind, job and provider level alike.
    pub failures_by_kind: BTreeMap<ErrorKind, usize>,
}

impl RunStats {
    pub fn new(jobs_total: usize) -> Self {
        Self {
            jobs_total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: &JobOutcome) {
        match outcome.status {
            JobStatus::Completed => self.jobs_completed += 1,
            JobStatus::Skipped => self.jobs_skipped += 1,
            JobStatus::Failed => self.jobs_failed += 1,
        }
        self.pages_persisted += outcome.pages_persisted;
        self.details_persisted += outcome.details_persisted;
    }

    pub fn record_failure(&mut self) {
        self.jobs_failed += 1;
    }

    pub fn jobs_finished(&self) -> usize {
        self.jobs_completed + self.jobs_skipped + self.jobs_failed
    }

    pub fn average_job_time(&self) -> Duration {
        let worked = self.jobs_completed + self.jobs_failed;
        if worked == 0 {
            return Duration::ZERO;
        }
        self.elapsed / worked as u32
    }
}
