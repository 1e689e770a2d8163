mod common;

use async_trait::async_trait;
use carecrawl::cache::{CacheError, DedupCache, FjallDedupCache};
use carecrawl::captcha::CaptchaProvider;
use carecrawl::detail::DetailFetcher;
use carecrawl::failures::FailureLog;
use carecrawl::job::Job;
use carecrawl::listing::{ListingWalker, WalkerOptions};
use carecrawl::scheduler::{JobProcessor, SchedulerOptionsBuilder, TaskScheduler};
use carecrawl::sink::MemorySink;
use carecrawl::stats::{JobOutcome, JobStatus};
use carecrawl::ErrorKind;
use carecrawl_config::HttpResponse;
use common::{fast_executor, job, listing_page, providers, CountingSolver, FakeApi, FakeTransport};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tempfile::tempdir;

fn jobs(n: usize) -> Vec<Job> {
    (0..n).map(|i| job(&format!("{:05}", 10001 + i), "Cardiology")).collect()
}

fn scheduler(
    processor: Arc<dyn JobProcessor>,
    failures: Arc<FailureLog>,
    concurrency: usize,
    batch_size: usize,
) -> TaskScheduler {
    TaskScheduler::new(
        processor,
        failures,
        SchedulerOptionsBuilder::default()
            .concurrency(concurrency)
            .batch_size(batch_size)
            .build()
            .unwrap(),
    )
}

fn completed() -> JobOutcome {
    JobOutcome {
        status: JobStatus::Completed,
        pages_persisted: 1,
        details_persisted: 0,
    }
}

/// Records `start:<zip>`, `end:<zip>` and `barrier` in order.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    panic_on: Option<String>,
    break_cache_on: Option<String>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobProcessor for Recorder {
    async fn process(&self, job: &Job) -> Result<JobOutcome, CacheError> {
        self.push(format!("start:{}", job.zip_code));
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.panic_on.as_deref() == Some(job.zip_code.as_str()) {
            panic!("parser blew up on {}", job.zip_code);
        }
        if self.break_cache_on.as_deref() == Some(job.zip_code.as_str()) {
            self.push(format!("end:{}", job.zip_code));
            return Err(CacheError::Closed);
        }
        self.push(format!("end:{}", job.zip_code));
        Ok(completed())
    }

    async fn on_batch_complete(&self) -> Result<(), CacheError> {
        self.push("barrier".to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_batches_are_barriers() {
    let recorder = Arc::new(Recorder::default());
    let scheduler = scheduler(recorder.clone(), Arc::new(FailureLog::in_memory()), 2, 2);

    let stats = scheduler.run(jobs(5)).await.unwrap();
    assert_eq!(stats.jobs_completed, 5);
    assert_eq!(stats.batches, 3);

    let events = recorder.events();
    let segments: Vec<&[String]> = events.split(|e| e == "barrier").collect();
    // Three batches, then the empty tail after the last barrier.
    assert_eq!(segments.len(), 4);
    assert!(segments[3].is_empty());
    for (segment, zips) in segments.iter().zip([
        vec!["10001", "10002"],
        vec!["10003", "10004"],
        vec!["10005"],
    ]) {
        let mut started: Vec<_> = segment
            .iter()
            .filter_map(|e| e.strip_prefix("start:"))
            .collect();
        started.sort();
        assert_eq!(started, zips);
        assert_eq!(
            segment.iter().filter(|e| e.starts_with("end:")).count(),
            zips.len()
        );
    }
}

#[tokio::test]
async fn test_panicking_job_does_not_abort_batch() {
    let recorder = Arc::new(Recorder {
        panic_on: Some("10002".into()),
        ..Recorder::default()
    });
    let failures = Arc::new(FailureLog::in_memory());
    let scheduler = scheduler(recorder.clone(), failures.clone(), 3, 3);

    let stats = scheduler.run(jobs(3)).await.unwrap();
    assert_eq!(stats.jobs_completed, 2);
    assert_eq!(stats.jobs_failed, 1);

    let events = failures.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ErrorKind::Panic);
    assert_eq!(events[0].job.zip_code, "10002");
    assert!(events[0].message.contains("parser blew up"));
}

#[tokio::test]
async fn test_cache_failure_stops_after_barrier() {
    let recorder = Arc::new(Recorder {
        break_cache_on: Some("10001".into()),
        ..Recorder::default()
    });
    let scheduler = scheduler(recorder.clone(), Arc::new(FailureLog::in_memory()), 2, 2);

    let err = scheduler.run(jobs(4)).await.unwrap_err();
    assert!(matches!(err, CacheError::Closed));

    let events = recorder.events();
    // The sibling job still finished; the second batch never started.
    assert!(events.contains(&"end:10002".to_string()));
    assert!(!events.iter().any(|e| e == "start:10003"));
    assert!(!events.contains(&"barrier".to_string()));
}

fn directory_transport(delay: Duration) -> Arc<FakeTransport> {
    FakeTransport::with_delay(
        |request| {
            if let Some(id) = request.url.strip_prefix("fake://detail/") {
                return Ok(HttpResponse::new(200, format!(r#"{{"id":"{id}"}}"#)));
            }
            let zip = common::listing_zip(&request.url);
            Ok(match listing_page(&request.url) {
                1 => providers(&[&format!("{zip}-a"), &format!("{zip}-b")], Some(2)),
                _ => providers(&[], None),
            })
        },
        delay,
    )
}

fn walker(
    transport: Arc<FakeTransport>,
    cache: Arc<dyn DedupCache>,
    failures: Arc<FailureLog>,
    sequential: bool,
) -> Arc<ListingWalker> {
    let captcha = CaptchaProvider::new(CountingSolver::new("solver"), "site-key", "https://page");
    let sink = Arc::new(MemorySink::new());
    let details = sequential.then(|| {
        DetailFetcher::new(
            fast_executor(transport.clone(), 2),
            FakeApi::new(2),
            None,
            sink.clone(),
            cache.clone(),
        )
    });
    Arc::new(ListingWalker::new(
        fast_executor(transport, 2),
        FakeApi::new(2),
        captcha,
        sink,
        cache,
        failures,
        details,
        WalkerOptions::default(),
    ))
}

#[tokio::test]
async fn test_concurrency_ceiling_is_respected() {
    let transport = directory_transport(Duration::from_millis(20));
    let cache: Arc<dyn DedupCache> = Arc::new(carecrawl::cache::InMemoryDedupCache::new());
    let failures = Arc::new(FailureLog::in_memory());
    let scheduler = scheduler(
        walker(transport.clone(), cache, failures.clone(), true),
        failures,
        3,
        12,
    );

    let stats = scheduler.run(jobs(12)).await.unwrap();
    assert_eq!(stats.jobs_completed, 12);
    assert_eq!(stats.pages_persisted, 12);
    assert_eq!(stats.details_persisted, 24);
    assert!(transport.max_in_flight() <= 3, "{}", transport.max_in_flight());
    assert!(transport.max_in_flight() > 1);
}

#[tokio::test]
async fn test_rerun_against_same_cache_issues_no_requests() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache");

    let first = directory_transport(Duration::ZERO);
    {
        let cache = Arc::new(FjallDedupCache::open(&path).unwrap());
        let failures = Arc::new(FailureLog::in_memory());
        let scheduler = scheduler(
            walker(first.clone(), cache.clone(), failures.clone(), true),
            failures,
            2,
            2,
        );
        let stats = scheduler.run(jobs(3)).await.unwrap();
        assert_eq!(stats.jobs_completed, 3);
        cache.close().await.unwrap();
    }
    // 3 listing pages + 6 details.
    assert_eq!(first.count(), 9);

    let second = directory_transport(Duration::ZERO);
    let cache = Arc::new(FjallDedupCache::open(&path).unwrap());
    let failures = Arc::new(FailureLog::in_memory());
    let scheduler = scheduler(
        walker(second.clone(), cache.clone(), failures.clone(), true),
        failures,
        2,
        2,
    );
    let stats = scheduler.run(jobs(3)).await.unwrap();

    assert_eq!(stats.jobs_skipped, 3);
    assert_eq!(second.count(), 0);
    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_listing_only_flow_skips_details() {
    let transport = directory_transport(Duration::ZERO);
    let cache: Arc<dyn DedupCache> = Arc::new(carecrawl::cache::InMemoryDedupCache::new());
    let failures = Arc::new(FailureLog::in_memory());
    let scheduler = scheduler(
        walker(transport.clone(), cache, failures.clone(), false),
        failures,
        2,
        2,
    );

    let stats = scheduler.run(jobs(2)).await.unwrap();
    assert_eq!(stats.details_persisted, 0);
    assert!(transport
        .requests()
        .iter()
        .all(|r| r.url.starts_with("fake://listing")));
}
