//! Wiring of the crawl pipeline from [`Settings`].
use crate::aura::AuraDirectoryApi;
use crate::captcha::{CaptchaChain, CaptchaProvider, CaptchaSolver, CapSolverSolver, TwoCaptchaSolver};
use crate::detail::DetailFetcher;
use crate::directory::DirectoryApi;
use crate::executor::{RequestExecutor, RetryPolicy};
use crate::failures::FailureLog;
use crate::inputs::JobCatalog;
use crate::job::Job;
use crate::listing::{ListingWalker, WalkerOptions};
use crate::scheduler::{SchedulerOptions, TaskScheduler};
use crate::sink::{ArtifactSink, JsonFileSink};
use crate::stats::RunStats;
use carecrawl_cache::{CacheError, DedupCache, FjallDedupCache};
use carecrawl_config::config::{load_text_file_lines, CaptchaStrategy};
use carecrawl_config::{
    ConfigError, HttpClientParams, HttpTransport, ProxyConfig, ReqwestTransport,
    RotatingHeaderProvider, Settings,
};
use std::sync::Arc;
use tracing::info;

/// Ordered solver chain for the configured strategies. A single strategy
/// still goes through the chain so stale tokens are discarded.
pub fn build_solver(settings: &Settings) -> Result<CaptchaChain, ConfigError> {
    let captcha = &settings.captcha;
    let params = HttpClientParams {
        timeout: settings.http.timeout,
        connect_timeout: settings.http.connect_timeout,
    };
    // Solver APIs are called directly, never through the scraping proxy.
    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::new(params, &ProxyConfig::disabled()));

    let mut solvers: Vec<Arc<dyn CaptchaSolver>> = Vec::new();
    for strategy in &captcha.strategies {
        match strategy {
            CaptchaStrategy::TwoCaptcha => {
                let key = captcha
                    .two_captcha_key
                    .clone()
                    .ok_or_else(|| ConfigError::MissingCredential("APIKEY_2CAPTCHA".into()))?;
                solvers.push(Arc::new(TwoCaptchaSolver::new(
                    key,
                    transport.clone(),
                    captcha.timeout,
                    captcha.poll_interval,
                )));
            }
            CaptchaStrategy::CapSolver => {
                let key = captcha
                    .capsolver_key
                    .clone()
                    .ok_or_else(|| ConfigError::MissingCredential("CAPSOLVER_API_KEY".into()))?;
                solvers.push(Arc::new(CapSolverSolver::new(
                    key,
                    captcha.action.clone(),
                    transport.clone(),
                    captcha.timeout,
                    captcha.poll_interval,
                )));
            }
            #[cfg(feature = "browser")]
            CaptchaStrategy::Browser => {
                use crate::captcha::{BrowserSolver, BrowserSolverOptions};
                solvers.push(Arc::new(BrowserSolver::new(
                    BrowserSolverOptions::from_settings(settings),
                )));
            }
            #[cfg(not(feature = "browser"))]
            CaptchaStrategy::Browser => {
                return Err(ConfigError::InvalidValue {
                    key: "CAPTCHA_STRATEGY".into(),
                    value: strategy.to_string(),
                    reason: "built without the `browser` feature".into(),
                });
            }
        }
    }

    Ok(CaptchaChain::new(solvers, captcha.token_validity))
}

pub fn build_executor(settings: &Settings) -> Result<RequestExecutor, ConfigError> {
    let user_agents = match &settings.http.user_agents_file {
        Some(path) => load_text_file_lines(path)?
            .into_iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect(),
        None => Vec::new(),
    };
    let params = HttpClientParams {
        timeout: settings.http.timeout,
        connect_timeout: settings.http.connect_timeout,
    };

    let policy = RetryPolicy::from_settings(&settings.http);
    info!(
        "Up to {} attempts per request, backoff around {:?}",
        policy.max_attempts,
        policy.delays()
    );
    Ok(RequestExecutor::new(
        Arc::new(ReqwestTransport::new(params, &settings.proxy)),
        Arc::new(RotatingHeaderProvider::new(
            user_agents,
            settings.http.header_refresh_requests,
        )),
        policy,
    ))
}

/// Jobs for this run: the failure-log replay when `REPROCESS_FAILED` is
/// set, otherwise the full catalog.
pub fn load_jobs(settings: &Settings) -> anyhow::Result<Vec<Job>> {
    if settings.flow.reprocess_failed {
        let jobs = FailureLog::read_jobs(&settings.paths.failed_jobs)?;
        info!(
            "Reprocessing {} failed jobs from {}",
            jobs.len(),
            settings.paths.failed_jobs.display()
        );
        return Ok(jobs);
    }
    let catalog = JobCatalog::load(&settings.paths)?;
    let jobs = catalog.jobs();
    info!(
        "Loaded {} zip codes and {} plans: {} jobs",
        catalog.zip_codes.len(),
        catalog.plans.len(),
        jobs.len()
    );
    Ok(jobs)
}

/// Fully wired crawler. The cache is exposed so callers can close it.
pub struct Crawler {
    pub cache: Arc<dyn DedupCache>,
    pub failures: Arc<FailureLog>,
    pub scheduler: TaskScheduler,
}

impl Crawler {
    /// Assemble the pipeline around an already-open cache.
    pub fn new(settings: &Settings, cache: Arc<dyn DedupCache>) -> anyhow::Result<Self> {
        let executor = build_executor(settings)?;
        let solver = build_solver(settings)?;
        info!("Captcha strategies: {solver:?}");
        let captcha = CaptchaProvider::new(
            Arc::new(solver),
            settings.captcha.site_key.clone(),
            settings.captcha.page_url.clone(),
        );
        let api: Arc<dyn DirectoryApi> = Arc::new(AuraDirectoryApi::new(&settings.target));
        let sink: Arc<dyn ArtifactSink> = Arc::new(JsonFileSink::new(&settings.paths.output));
        let failures = Arc::new(FailureLog::new(&settings.paths.failed_jobs));

        let details = settings.flow.sequential.then(|| {
            DetailFetcher::new(
                executor.clone(),
                api.clone(),
                settings
                    .captcha
                    .detail_requires_captcha
                    .then(|| captcha.clone()),
                sink.clone(),
                cache.clone(),
            )
        });

        let walker = ListingWalker::new(
            executor,
            api,
            captcha,
            sink,
            cache.clone(),
            failures.clone(),
            details,
            WalkerOptions {
                max_pages: settings.flow.max_pages,
                detail_concurrency: settings.flow.detail_concurrency,
            },
        );
        info!(
            "Listing walks capped at {} pages, {} detail fetches per job",
            walker.options().max_pages,
            walker.options().detail_concurrency
        );
        let scheduler = TaskScheduler::new(
            Arc::new(walker),
            failures.clone(),
            SchedulerOptions {
                concurrency: settings.flow.concurrency,
                batch_size: settings.flow.batch_size,
            },
        );

        Ok(Self {
            cache,
            failures,
            scheduler,
        })
    }

    pub async fn run(&self, jobs: Vec<Job>) -> Result<RunStats, CacheError> {
        info!("Run {} starting", self.failures.run_id());
        let mut stats = self.scheduler.run(jobs).await?;
        stats.failures_by_kind = self.failures.counts().await;
        Ok(stats)
    }
}

pub fn open_cache(settings: &Settings) -> Result<Arc<FjallDedupCache>, CacheError> {
    Ok(Arc::new(FjallDedupCache::open(&settings.paths.cache)?))
}
