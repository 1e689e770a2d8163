use carecrawl_cache::CacheError;
use carecrawl_config::TransportError;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;

/// Failure category recorded in failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    FatalHttp,
    CaptchaSolveFailure,
    ResponseRejected,
    Persist,
    Panic,
    /// Listing still had pages when the page cap stopped the walk.
    PageCapReached,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientNetwork => "transient_network",
            Self::FatalHttp => "fatal_http",
            Self::CaptchaSolveFailure => "captcha_solve_failure",
            Self::ResponseRejected => "response_rejected",
            Self::Persist => "persist",
            Self::Panic => "panic",
            Self::PageCapReached => "page_cap_reached",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum CaptchaError {
    #[error("{solver}: no token after {elapsed:?}")]
    Timeout {
        solver: &'static str,
        elapsed: Duration,
    },
    #[error("{solver}: insufficient balance")]
    InsufficientBalance { solver: &'static str },
    #[error("{solver}: service error: {message}")]
    Service {
        solver: &'static str,
        message: String,
    },
    #[error("{solver}: transport error: {source}")]
    Transport {
        solver: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("browser error: {0}")]
    Browser(String),
    #[error("{solver}: token expired after {age:?}")]
    Expired { solver: &'static str, age: Duration },
    #[error("all captcha strategies failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("transient network error after {attempts} attempts: {reason}")]
    TransientNetwork { attempts: u32, reason: String },
    #[error("fatal HTTP status {status}")]
    FatalHttp { status: u16, body: String },
    #[error("captcha failed after {attempts} attempts: {source}")]
    Captcha {
        attempts: u32,
        #[source]
        source: CaptchaError,
    },
    #[error("response rejected after {attempts} attempts: {reason}")]
    Rejected { attempts: u32, reason: String },
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            Self::FatalHttp { .. } => ErrorKind::FatalHttp,
            Self::Captcha { .. } => ErrorKind::CaptchaSolveFailure,
            Self::Rejected { .. } => ErrorKind::ResponseRejected,
        }
    }

    /// Attempts spent before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::TransientNetwork { attempts, .. }
            | Self::Captcha { attempts, .. }
            | Self::Rejected { attempts, .. } => *attempts,
            Self::FatalHttp { .. } => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Per-job failure. Caught at the job boundary and turned into a
/// failure event, except for [`CrawlError::Cache`] which aborts the run.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("persist error: {0}")]
    Sink(#[from] SinkError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

impl CrawlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Request(e) => e.kind(),
            Self::Sink(_) | Self::Cache(_) => ErrorKind::Persist,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Request(e) => e.attempts(),
            Self::Sink(_) | Self::Cache(_) => 1,
        }
    }
}
