//! Listing pagination for one job.
//!
//! ```text
//! Init -> FetchingPage -> HasMore -> FetchingPage -> ... -> Exhausted -> Done
//!                      \-> (page cap reached) ---------------------------> Done
//! ```
//!
//! Pages are fetched strictly in order. In sequential flow every provider
//! collected along the way is handed to the [`DetailFetcher`] once the walk
//! reaches `Done`.
use crate::captcha::CaptchaProvider;
use crate::detail::{DetailFetcher, DetailStatus};
use crate::directory::{DirectoryApi, ListingCursor, ListingPage, ProviderRef};
use crate::error::{CaptchaError, CrawlError, ErrorKind};
use crate::executor::{Exchange, Rejection, RequestExecutor};
use crate::failures::FailureLog;
use crate::job::Job;
use crate::scheduler::JobProcessor;
use crate::sink::ArtifactSink;
use crate::stats::{JobOutcome, JobStatus};
use async_trait::async_trait;
use carecrawl_cache::{CacheError, DedupCache};
use carecrawl_config::{HttpRequest, HttpResponse};
use derive_builder::Builder;
use futures::{stream, StreamExt};
use serde::Serialize;
use std::{collections::HashSet, fmt, sync::Arc};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WalkState {
    Init,
    FetchingPage,
    HasMore,
    Exhausted,
    Done,
}

impl fmt::Display for WalkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Builder, Clone, Debug)]
#[builder(public, setter(into))]
pub struct WalkerOptions {
    /// Hard ceiling on pages per job.
    #[builder(default = "200")]
    pub max_pages: u32,
    /// Parallel detail fetches per job in sequential flow.
    #[builder(default = "1")]
    pub detail_concurrency: usize,
}

impl Default for WalkerOptions {
    fn default() -> Self {
        Self {
            max_pages: 200,
            detail_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkReport {
    pub job: Job,
    pub trace: Vec<WalkState>,
    pub pages_persisted: usize,
    pub providers: Vec<ProviderRef>,
    pub details_persisted: usize,
    pub details_failed: usize,
    /// Stopped by the page cap rather than by exhaustion. Such a walk counts
    /// as failed and stays unmarked.
    pub capped: bool,
    /// Job was already marked seen.
    pub skipped: bool,
    pub failed: bool,
}

impl WalkReport {
    fn new(job: &Job) -> Self {
        Self {
            job: job.clone(),
            trace: vec![WalkState::Init],
            pages_persisted: 0,
            providers: Vec::new(),
            details_persisted: 0,
            details_failed: 0,
            capped: false,
            skipped: false,
            failed: false,
        }
    }

    fn enter(&mut self, state: WalkState) {
        self.trace.push(state);
    }

    pub fn state(&self) -> WalkState {
        self.trace.last().copied().unwrap_or(WalkState::Init)
    }

    pub fn outcome(&self) -> JobOutcome {
        if self.skipped {
            return JobOutcome::skipped();
        }
        let status = if self.failed {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        JobOutcome {
            status,
            pages_persisted: self.pages_persisted,
            details_persisted: self.details_persisted,
        }
    }
}

struct ListingExchange<'a> {
    api: &'a dyn DirectoryApi,
    captcha: &'a CaptchaProvider,
    job: &'a Job,
    cursor: ListingCursor,
}

#[async_trait]
impl<'a> Exchange for ListingExchange<'a> {
    type Output = ListingPage;

    fn label(&self) -> String {
        format!("listing page {}", self.cursor.page_number)
    }

    async fn prepare(&self, _attempt: u32) -> Result<HttpRequest, CaptchaError> {
        let token = self.captcha.acquire().await?;
        Ok(self.api.listing_request(self.job, &self.cursor, token))
    }

    fn accept(&self, response: HttpResponse) -> Result<ListingPage, Rejection> {
        self.api.parse_listing(&response)
    }
}

/// Page-level failure that ends a walk.
enum PageFailure {
    Crawl(CrawlError),
    Cache(CacheError),
}

impl From<CrawlError> for PageFailure {
    fn from(e: CrawlError) -> Self {
        match e {
            CrawlError::Cache(e) => Self::Cache(e),
            other => Self::Crawl(other),
        }
    }
}

pub struct ListingWalker {
    executor: RequestExecutor,
    api: Arc<dyn DirectoryApi>,
    captcha: CaptchaProvider,
    sink: Arc<dyn ArtifactSink>,
    cache: Arc<dyn DedupCache>,
    failures: Arc<FailureLog>,
    /// Set in sequential flow.
    details: Option<DetailFetcher>,
    options: WalkerOptions,
}

impl ListingWalker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: RequestExecutor,
        api: Arc<dyn DirectoryApi>,
        captcha: CaptchaProvider,
        sink: Arc<dyn ArtifactSink>,
        cache: Arc<dyn DedupCache>,
        failures: Arc<FailureLog>,
        details: Option<DetailFetcher>,
        options: WalkerOptions,
    ) -> Self {
        Self {
            executor,
            api,
            captcha,
            sink,
            cache,
            failures,
            details,
            options,
        }
    }

    pub fn options(&self) -> &WalkerOptions {
        &self.options
    }

    /// Walk one job to `Done`. Request and persist failures are written to
    /// the failure log and reported in the result; only cache failures are
    /// returned as errors.
    #[instrument(skip_all, fields(job = %job))]
    pub async fn walk(&self, job: &Job) -> Result<WalkReport, CacheError> {
        let mut report = WalkReport::new(job);
        let key = job.cache_key();

        if self.cache.has(&key).await? {
            info!("Job already processed, skipping");
            report.skipped = true;
            report.enter(WalkState::Done);
            return Ok(report);
        }

        let mut cursor = ListingCursor::first();
        match self.collect_pages(job, &mut cursor, &mut report).await {
            Ok(()) => {}
            Err(PageFailure::Cache(e)) => return Err(e),
            Err(PageFailure::Crawl(e)) => {
                self.failures
                    .record_job(job, Some(cursor.page_number), &e)
                    .await;
                report.failed = true;
                report.enter(WalkState::Done);
                return Ok(report);
            }
        }
        report.enter(WalkState::Done);

        if let Some(details) = &self.details {
            self.fetch_details(details, job, &mut report).await?;
        }

        if report.details_failed > 0 {
            warn!(
                "{} of {} provider details failed, job left unmarked",
                report.details_failed,
                report.providers.len()
            );
            report.failed = true;
        } else if report.capped {
            warn!("Job truncated by the page cap, left unmarked for replay");
        } else {
            self.cache.put(&key).await?;
            info!(
                "Job done: {} pages, {} providers, {} details saved",
                report.pages_persisted,
                report.providers.len(),
                report.details_persisted
            );
        }
        Ok(report)
    }

    async fn collect_pages(
        &self,
        job: &Job,
        cursor: &mut ListingCursor,
        report: &mut WalkReport,
    ) -> Result<(), PageFailure> {
        let page_size = self.api.page_size();
        let mut seen_ids = HashSet::new();

        loop {
            report.enter(WalkState::FetchingPage);
            let exchange = ListingExchange {
                api: self.api.as_ref(),
                captcha: &self.captcha,
                job,
                cursor: *cursor,
            };
            let page = self
                .executor
                .run(&exchange)
                .await
                .map_err(CrawlError::from)?;

            if page.is_empty() {
                cursor.has_more = false;
                report.enter(WalkState::Exhausted);
                return Ok(());
            }

            self.sink
                .persist_listing(job, cursor.page_number, &page.payload)
                .await
                .map_err(CrawlError::from)?;
            report.pages_persisted += 1;

            for provider in page.records {
                if seen_ids.insert(provider.id.clone()) {
                    report.providers.push(provider);
                }
            }

            let reached_total = page.total_records.is_some_and(|total| {
                u64::from(cursor.page_number) * u64::from(page_size) >= total
            });
            if reached_total {
                cursor.has_more = false;
                report.enter(WalkState::Exhausted);
                return Ok(());
            }

            if cursor.page_number >= self.options.max_pages {
                warn!(
                    "Page cap of {} reached before the listing was exhausted",
                    self.options.max_pages
                );
                self.failures
                    .record(
                        job,
                        None,
                        Some(cursor.page_number),
                        ErrorKind::PageCapReached,
                        1,
                        format!(
                            "listing truncated at page cap {}",
                            self.options.max_pages
                        ),
                    )
                    .await;
                report.capped = true;
                report.failed = true;
                return Ok(());
            }

            report.enter(WalkState::HasMore);
            cursor.advance();
        }
    }

    async fn fetch_details(
        &self,
        details: &DetailFetcher,
        job: &Job,
        report: &mut WalkReport,
    ) -> Result<(), CacheError> {
        let fatal: Mutex<Option<CacheError>> = Mutex::new(None);
        let counts = Mutex::new((0usize, 0usize));

        stream::iter(report.providers.iter())
            .for_each_concurrent(self.options.detail_concurrency.max(1), |provider| {
                let fatal = &fatal;
                let counts = &counts;
                async move {
                    match details.fetch_detail(job, provider).await {
                        Ok(DetailStatus::Fetched) => counts.lock().await.0 += 1,
                        Ok(DetailStatus::AlreadySeen) => {}
                        Err(CrawlError::Cache(e)) => {
                            counts.lock().await.1 += 1;
                            fatal.lock().await.get_or_insert(e);
                        }
                        Err(e) => {
                            counts.lock().await.1 += 1;
                            self.failures.record_provider(job, &provider.id, &e).await;
                        }
                    }
                }
            })
            .await;

        let (persisted, failed) = counts.into_inner();
        report.details_persisted = persisted;
        report.details_failed = failed;
        match fatal.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl JobProcessor for ListingWalker {
    async fn process(&self, job: &Job) -> Result<JobOutcome, CacheError> {
        Ok(self.walk(job).await?.outcome())
    }

    async fn on_batch_complete(&self) -> Result<(), CacheError> {
        self.cache.flush().await
    }
}
