//! Shared plumbing for the remote solving services.
use crate::error::CaptchaError;
use carecrawl_config::{HeaderProfile, HttpRequest, HttpTransport};
use serde_json::Value;
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tracing::warn;

pub(crate) enum PollStatus<T> {
    Ready(T),
    Pending,
}

/// Sleep `interval`, call `check`, repeat until it is ready or `timeout`
/// has elapsed since the first call.
pub(crate) async fn poll_until<T, F, Fut>(
    solver: &'static str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<T, CaptchaError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, CaptchaError>>,
{
    let started = Instant::now();
    loop {
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(CaptchaError::Timeout { solver, elapsed });
        }
        tokio::time::sleep(interval.min(timeout - elapsed)).await;

        match check().await {
            Ok(PollStatus::Ready(value)) => return Ok(value),
            Ok(PollStatus::Pending) => {}
            // A flaky poll is not fatal while time remains.
            Err(CaptchaError::Transport { source, .. }) if source.is_transient() => {
                warn!("{solver}: poll failed, will retry: {source}");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Send one request to a solving service and decode the JSON body.
pub(crate) async fn send_json(
    solver: &'static str,
    transport: &dyn HttpTransport,
    profile: &HeaderProfile,
    request: &HttpRequest,
) -> Result<Value, CaptchaError> {
    let response = transport
        .send(request, profile)
        .await
        .map_err(|source| CaptchaError::Transport { solver, source })?;

    if !response.is_success() {
        return Err(CaptchaError::Service {
            solver,
            message: format!("HTTP {}", response.status),
        });
    }

    serde_json::from_str(&response.body).map_err(|e| CaptchaError::Service {
        solver,
        message: format!("invalid JSON response: {e}"),
    })
}

/// Profile used for solver APIs; they see a plain API client.
pub(crate) fn api_profile() -> HeaderProfile {
    HeaderProfile {
        user_agent: concat!("carecrawl/", env!("CARGO_PKG_VERSION")).to_string(),
        accept_language: "en-US".to_string(),
        headers: vec![("accept".to_string(), "application/json".to_string())],
    }
}
