//! CapSolver `createTask` / `getTaskResult` protocol.
use super::poll::{api_profile, poll_until, send_json, PollStatus};
use super::{CaptchaSolver, CaptchaToken};
use crate::error::CaptchaError;
use async_trait::async_trait;
use carecrawl_config::{HeaderProfile, HttpRequest, HttpTransport};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

const NAME: &str = "capsolver";
pub const DEFAULT_BASE_URL: &str = "https://api.capsolver.com";

pub struct CapSolverSolver {
    api_key: String,
    base_url: String,
    page_action: String,
    min_score: f64,
    transport: Arc<dyn HttpTransport>,
    profile: HeaderProfile,
    timeout: Duration,
    poll_interval: Duration,
    // Set once a balance check reports zero.
    out_of_funds: AtomicBool,
}

impl CapSolverSolver {
    pub fn new(
        api_key: impl Into<String>,
        page_action: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            page_action: page_action.into(),
            min_score: 0.9,
            transport,
            profile: api_profile(),
            timeout,
            poll_interval,
            out_of_funds: AtomicBool::new(false),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value, CaptchaError> {
        let request = HttpRequest::post(format!("{}/{method}", self.base_url))
            .header("content-type", "application/json")
            .body(payload.to_string());
        let body = send_json(NAME, self.transport.as_ref(), &self.profile, &request).await?;
        check_error(body)
    }

    async fn create_task(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError> {
        let body = self
            .call(
                "createTask",
                json!({
                    "clientKey": self.api_key,
                    "task": {
                        "type": "ReCaptchaV2TaskProxyless",
                        "websiteURL": page_url,
                        "websiteKey": site_key,
                        "isInvisible": true,
                        "pageAction": self.page_action,
                        "minScore": self.min_score,
                    }
                }),
            )
            .await?;

        match body.get("taskId") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(CaptchaError::Service {
                solver: NAME,
                message: format!("createTask reply without taskId: {body}"),
            }),
        }
    }

    async fn task_result(&self, task_id: &str) -> Result<PollStatus<String>, CaptchaError> {
        let body = self
            .call(
                "getTaskResult",
                json!({ "clientKey": self.api_key, "taskId": task_id }),
            )
            .await?;

        match body.get("status").and_then(Value::as_str) {
            Some("ready") => body
                .pointer("/solution/gRecaptchaResponse")
                .and_then(Value::as_str)
                .map(|token| PollStatus::Ready(token.to_string()))
                .ok_or_else(|| CaptchaError::Service {
                    solver: NAME,
                    message: "ready task without gRecaptchaResponse".into(),
                }),
            Some("idle") | Some("processing") | None => Ok(PollStatus::Pending),
            Some(other) => Err(CaptchaError::Service {
                solver: NAME,
                message: format!("task status `{other}`"),
            }),
        }
    }

    /// Remaining account balance in USD.
    pub async fn balance(&self) -> Result<f64, CaptchaError> {
        let body = self
            .call("getBalance", json!({ "clientKey": self.api_key }))
            .await?;
        body.get("balance")
            .and_then(Value::as_f64)
            .ok_or_else(|| CaptchaError::Service {
                solver: NAME,
                message: "getBalance reply without balance".into(),
            })
    }
}

/// `errorId != 0` carries `errorCode` and `errorDescription`.
fn check_error(body: Value) -> Result<Value, CaptchaError> {
    let error_id = body.get("errorId").and_then(Value::as_i64).unwrap_or(0);
    if error_id == 0 {
        return Ok(body);
    }

    let code = body
        .get("errorCode")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");
    if code == "ERROR_ZERO_BALANCE" {
        return Err(CaptchaError::InsufficientBalance { solver: NAME });
    }
    let description = body
        .get("errorDescription")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Err(CaptchaError::Service {
        solver: NAME,
        message: format!("{code}: {description}"),
    })
}

#[async_trait]
impl CaptchaSolver for CapSolverSolver {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip_all, fields(solver = NAME))]
    async fn solve(&self, site_key: &str, page_url: &str) -> Result<CaptchaToken, CaptchaError> {
        if self.out_of_funds.load(Ordering::Relaxed) {
            return Err(CaptchaError::InsufficientBalance { solver: NAME });
        }
        let task_id = self.create_task(site_key, page_url).await?;
        debug!("Created task {task_id}");

        let token = poll_until(NAME, self.timeout, self.poll_interval, || {
            self.task_result(&task_id)
        })
        .await?;

        match self.balance().await {
            Ok(balance) if balance <= 0.0 => {
                warn!("CapSolver balance exhausted after this solve");
                self.out_of_funds.store(true, Ordering::Relaxed);
            }
            Ok(balance) => info!("CapSolver balance: {balance:.3}"),
            Err(e) => warn!("Could not read CapSolver balance: {e}"),
        }

        Ok(CaptchaToken::new(token, NAME))
    }
}
