//! Batched, bounded-concurrency job runner.
//!
//! Jobs are split into consecutive batches of `batch_size`. Inside a batch
//! at most `concurrency` jobs run at once; the next batch starts only when
//! every job of the current one has finished.
use crate::error::ErrorKind;
use crate::failures::FailureLog;
use crate::job::Job;
use crate::stats::{JobOutcome, RunStats};
use async_trait::async_trait;
use carecrawl_cache::CacheError;
use derive_builder::Builder;
use futures::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info, warn, Instrument};

/// One unit of per-job work driven by the scheduler.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Run one job. Per-job failures are recorded by the processor and
    /// reported through [`JobOutcome`]; an `Err` means the cache is broken
    /// and the run must stop.
    async fn process(&self, job: &Job) -> Result<JobOutcome, CacheError>;

    /// Called after each batch barrier.
    async fn on_batch_complete(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Builder, Clone, Debug)]
#[builder(public, setter(into))]
pub struct SchedulerOptions {
    #[builder(default = "5")]
    pub concurrency: usize,
    #[builder(default = "50")]
    pub batch_size: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 50,
        }
    }
}

type TaskResult = (Job, Result<Result<JobOutcome, CacheError>, Box<dyn Any + Send>>);

pub struct TaskScheduler {
    processor: Arc<dyn JobProcessor>,
    failures: Arc<FailureLog>,
    options: SchedulerOptions,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "job panicked".to_string()
    }
}

impl TaskScheduler {
    pub fn new(
        processor: Arc<dyn JobProcessor>,
        failures: Arc<FailureLog>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            processor,
            failures,
            options,
        }
    }

    pub async fn run(&self, jobs: Vec<Job>) -> Result<RunStats, CacheError> {
        let started = Instant::now();
        let concurrency = self.options.concurrency.max(1);
        let batch_size = self.options.batch_size.max(1);
        let mut stats = RunStats::new(jobs.len());
        let batches = jobs.len().div_ceil(batch_size);

        info!(
            "Scheduling {} jobs in {} batches (concurrency {}, batch size {})",
            jobs.len(),
            batches,
            concurrency,
            batch_size
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut jobs = jobs.into_iter().peekable();
        let mut batch_no = 0;

        while jobs.peek().is_some() {
            batch_no += 1;
            let batch: Vec<Job> = jobs.by_ref().take(batch_size).collect();
            let span = tracing::info_span!("batch", batch = batch_no);
            let fatal = self
                .run_batch(batch, &semaphore, &mut stats)
                .instrument(span)
                .await;

            stats.batches = batch_no;
            stats.elapsed = started.elapsed();
            info!(
                "Batch {}/{} done: {}/{} jobs finished ({} completed, {} skipped, {} failed)",
                batch_no,
                batches,
                stats.jobs_finished(),
                stats.jobs_total,
                stats.jobs_completed,
                stats.jobs_skipped,
                stats.jobs_failed
            );

            if let Some(e) = fatal {
                error!("Cache failure, stopping after batch {batch_no}: {e}");
                return Err(e);
            }
            self.processor.on_batch_complete().await?;
        }

        stats.elapsed = started.elapsed();
        info!(
            "Run finished in {:.1}s ({:.2}s per job): {} pages, {} details persisted",
            stats.elapsed.as_secs_f32(),
            stats.average_job_time().as_secs_f32(),
            stats.pages_persisted,
            stats.details_persisted
        );
        Ok(stats)
    }

    /// Run one batch to completion; returns the first cache failure, if any.
    async fn run_batch(
        &self,
        batch: Vec<Job>,
        semaphore: &Arc<Semaphore>,
        stats: &mut RunStats,
    ) -> Option<CacheError> {
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        for job in batch {
            let processor = Arc::clone(&self.processor);
            let semaphore = Arc::clone(semaphore);
            let span = tracing::info_span!("job", job = %job);
            tasks.spawn(
                async move {
                    // The semaphore is never closed.
                    let _permit = semaphore.acquire_owned().await;
                    let result = AssertUnwindSafe(processor.process(&job))
                        .catch_unwind()
                        .await;
                    (job, result)
                }
                .instrument(span),
            );
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(outcome)))) => stats.record(&outcome),
                Ok((job, Ok(Err(e)))) => {
                    stats.record_failure();
                    self.failures
                        .record(&job, None, None, ErrorKind::Persist, 1, e.to_string())
                        .await;
                    fatal.get_or_insert(e);
                }
                Ok((job, Err(panic))) => {
                    stats.record_failure();
                    self.failures
                        .record(&job, None, None, ErrorKind::Panic, 1, panic_message(&*panic))
                        .await;
                }
                Err(e) => {
                    stats.record_failure();
                    warn!("Job task did not complete: {e}");
                }
            }
        }

        // Release the batch's tasks and buffers before the next one.
        drop(tasks);
        fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = SchedulerOptionsBuilder::default().build().unwrap();
        assert_eq!(options.concurrency, 5);
        assert_eq!(options.batch_size, 50);

        let options = SchedulerOptionsBuilder::default()
            .concurrency(2usize)
            .build()
            .unwrap();
        assert_eq!(options.concurrency, 2);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(&*payload), "job panicked");
    }
}
