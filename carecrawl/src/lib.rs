//! # carecrawl
//!
//! Resilient scraper for a CAPTCHA-protected provider directory.
//!
//! A run expands inputs into [`job::Job`]s and hands them to the
//! [`scheduler::TaskScheduler`], which drives a [`listing::ListingWalker`]
//! per job in bounded-concurrency batches. Every request goes through the
//! retrying [`executor::RequestExecutor`]; challenge tokens come from a
//! [`captcha::CaptchaSolver`] chain (remote solving services and a real
//! browser). Completed jobs and providers are remembered in a persistent
//! dedup cache so reruns only do the missing work.
//!
//! ## Modules
//!
//! - `aura`: the directory's Salesforce Aura protocol.
//! - `captcha`: token solvers and the fallback chain.
//! - `detail`: provider detail fetching.
//! - `executor`: retrying request primitive.
//! - `failures`: failed-job log and replay.
//! - `inputs`: zip/plan/specialty inputs.
//! - `listing`: listing pagination state machine.
//! - `scheduler`: batched job runner.
//! - `sink`: artifact persistence.
pub mod app;
pub mod aura;
pub mod captcha;
pub mod detail;
pub mod directory;
pub mod error;
pub mod executor;
pub mod failures;
pub mod inputs;
pub mod job;
pub mod listing;
pub mod logging;
pub mod scheduler;
pub mod sink;
pub mod stats;

pub use app::Crawler;
pub use error::{CaptchaError, CrawlError, ErrorKind, RequestError, SinkError};
pub use job::{Job, Plan, ServiceType};
// re-export
pub use carecrawl_cache as cache;
pub use carecrawl_config as config;
