//! Retrying request primitive.
//!
//! [`RequestExecutor::run`] drives an [`Exchange`] through at most
//! `max_attempts` attempts:
//! - 2xx responses go to [`Exchange::accept`]
//! - 408, 429 and 5xx (and transient transport errors) are retried
//! - any other status is returned at once as [`RequestError::FatalHttp`]
//!
//! Delays come from an exponential backoff with jitter; a `Retry-After`
//! header on the failed response overrides the computed delay.
use crate::error::{CaptchaError, RequestError};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use carecrawl_config::config::HttpSettings;
use carecrawl_config::{HeaderProvider, HttpRequest, HttpResponse, HttpTransport};
use derive_builder::Builder;
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};

#[derive(Builder, Clone, Debug)]
#[builder(public, setter(into))]
pub struct RetryPolicy {
    #[builder(default = "5")]
    pub max_attempts: u32,
    #[builder(default = "std::time::Duration::from_secs(1)")]
    pub initial_interval: Duration,
    #[builder(default = "2.5")]
    pub multiplier: f64,
    #[builder(default = "std::time::Duration::from_secs(60)")]
    pub max_interval: Duration,
    /// Randomization factor, `0.0` disables jitter.
    #[builder(default = "0.3")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            multiplier: 2.5,
            max_interval: Duration::from_secs(60),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &HttpSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_interval: settings.backoff_initial,
            multiplier: settings.backoff_multiplier,
            max_interval: settings.backoff_max_interval,
            jitter: settings.backoff_jitter,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        // The attempt ceiling bounds retries, not elapsed time.
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_interval)
            .with_randomization_factor(self.jitter)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Delays the policy would sleep between attempts when no
    /// `Retry-After` is present.
    pub fn delays(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (1..self.max_attempts)
            .map(|_| backoff.next_backoff().unwrap_or(self.max_interval))
            .collect()
    }
}

/// Progress of one in-flight request. Never shared between requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub next_delay: Option<Duration>,
}

/// Outcome of validating a 2xx body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Envelope not usable yet; counts as a transient failure.
    Retry(String),
    Fatal(String),
}

/// One logical request: how to build each attempt and how to read a
/// successful response.
#[async_trait]
pub trait Exchange: Send + Sync {
    type Output: Send;

    /// Short label for logs.
    fn label(&self) -> String {
        "request".to_string()
    }

    /// Build the request for `attempt` (1-based). Anything single-use, such
    /// as a captcha token, is acquired here so it serves exactly one attempt.
    async fn prepare(&self, attempt: u32) -> Result<HttpRequest, CaptchaError>;

    fn accept(&self, response: HttpResponse) -> Result<Self::Output, Rejection>;
}

enum Failure {
    Network(String),
    Rejected(String),
    Captcha(CaptchaError),
}

impl Failure {
    fn describe(&self) -> String {
        match self {
            Self::Network(reason) | Self::Rejected(reason) => reason.clone(),
            Self::Captcha(e) => e.to_string(),
        }
    }

    fn into_error(self, attempts: u32) -> RequestError {
        match self {
            Self::Network(reason) => RequestError::TransientNetwork { attempts, reason },
            Self::Rejected(reason) => RequestError::Rejected { attempts, reason },
            Self::Captcha(source) => RequestError::Captcha { attempts, source },
        }
    }
}

pub(crate) fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

#[derive(Clone, Debug)]
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    headers: Arc<dyn HeaderProvider>,
    policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        headers: Arc<dyn HeaderProvider>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            headers,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send a fixed request with retries, returning the first 2xx response.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RequestError> {
        self.run(&PlainExchange { request }).await
    }

    #[instrument(skip_all, fields(exchange = %exchange.label()))]
    pub async fn run<E: Exchange>(&self, exchange: &E) -> Result<E::Output, RequestError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.backoff();
        let mut state = RetryState::default();

        loop {
            state.attempt += 1;
            let mut retry_after = None;

            let failure = match exchange.prepare(state.attempt).await {
                Err(e) => Failure::Captcha(e),
                Ok(request) => {
                    debug!(
                        "{} {} (attempt {}/{})",
                        request.method, request.url, state.attempt, max_attempts
                    );
                    let profile = self.headers.profile();
                    match self.transport.send(&request, &profile).await {
                        Ok(response) if response.is_success() => {
                            match exchange.accept(response) {
                                Ok(output) => return Ok(output),
                                Err(Rejection::Fatal(reason)) => {
                                    return Err(RequestError::Rejected {
                                        attempts: state.attempt,
                                        reason,
                                    });
                                }
                                Err(Rejection::Retry(reason)) => Failure::Rejected(reason),
                            }
                        }
                        Ok(response) if is_transient_status(response.status) => {
                            retry_after = response.retry_after();
                            Failure::Network(format!("HTTP {}", response.status))
                        }
                        Ok(response) => {
                            return Err(RequestError::FatalHttp {
                                status: response.status,
                                body: response.body,
                            });
                        }
                        Err(e) if e.is_transient() => Failure::Network(e.to_string()),
                        Err(e) => {
                            return Err(RequestError::Rejected {
                                attempts: state.attempt,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            };

            if state.attempt >= max_attempts {
                warn!(
                    "Giving up after {} attempts: {}",
                    state.attempt,
                    failure.describe()
                );
                return Err(failure.into_error(state.attempt));
            }

            let computed = backoff.next_backoff().unwrap_or(self.policy.max_interval);
            let delay = retry_after.unwrap_or(computed);
            state.next_delay = Some(delay);
            warn!(
                "Attempt {}/{} failed: {}; retrying in {:?}",
                state.attempt,
                max_attempts,
                failure.describe(),
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

struct PlainExchange {
    request: HttpRequest,
}

#[async_trait]
impl Exchange for PlainExchange {
    type Output = HttpResponse;

    fn label(&self) -> String {
        format!("{} {}", self.request.method, self.request.url)
    }

    async fn prepare(&self, _attempt: u32) -> Result<HttpRequest, CaptchaError> {
        Ok(self.request.clone())
    }

    fn accept(&self, response: HttpResponse) -> Result<HttpResponse, Rejection> {
        Ok(response)
    }
}
