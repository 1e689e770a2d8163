use anyhow::Context;
use carecrawl::{app, cache::DedupCache, config::Settings, logging, Crawler};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("invalid configuration")?;
    logging::init_logging(&settings.paths.critical_log)
        .with_context(|| format!("cannot open {}", settings.paths.critical_log.display()))?;

    let cache = app::open_cache(&settings)
        .with_context(|| format!("cannot open cache at {}", settings.paths.cache.display()))?;
    let result = run(&settings, cache.clone()).await;

    // Close on every path, including failed runs.
    if let Err(e) = cache.close().await {
        error!("Failed to close cache: {e}");
    }

    let stats = result?;
    info!(
        "Done: {}/{} jobs completed, {} skipped, {} failed, {} pages, {} details in {:.1}s",
        stats.jobs_completed,
        stats.jobs_total,
        stats.jobs_skipped,
        stats.jobs_failed,
        stats.pages_persisted,
        stats.details_persisted,
        stats.elapsed.as_secs_f32()
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn run(
    settings: &Settings,
    cache: Arc<dyn DedupCache>,
) -> anyhow::Result<carecrawl::stats::RunStats> {
    let jobs = app::load_jobs(settings)?;
    let crawler = Crawler::new(settings, cache)?;
    let stats = crawler.run(jobs).await?;
    if !crawler.failures.is_empty().await {
        info!(
            "{} failures recorded in {}",
            crawler.failures.len().await,
            settings.paths.failed_jobs.display()
        );
    }
    Ok(stats)
}
