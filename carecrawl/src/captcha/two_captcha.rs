//! 2Captcha `in.php` / `res.php` protocol.
use super::poll::{api_profile, poll_until, send_json, PollStatus};
use super::{CaptchaSolver, CaptchaToken};
use crate::error::CaptchaError;
use async_trait::async_trait;
use carecrawl_config::{HeaderProfile, HttpRequest, HttpTransport};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument};
use url::form_urlencoded;

const NAME: &str = "two_captcha";
pub const DEFAULT_BASE_URL: &str = "https://2captcha.com";

pub struct TwoCaptchaSolver {
    api_key: String,
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    profile: HeaderProfile,
    timeout: Duration,
    poll_interval: Duration,
}

impl TwoCaptchaSolver {
    pub fn new(
        api_key: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            transport,
            profile: api_profile(),
            timeout,
            poll_interval,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn submit(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError> {
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("key", &self.api_key)
            .append_pair("method", "userrecaptcha")
            .append_pair("googlekey", site_key)
            .append_pair("pageurl", page_url)
            .append_pair("invisible", "1")
            .append_pair("json", "1")
            .finish();
        let request = HttpRequest::post(format!("{}/in.php", self.base_url))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body);

        let response = send_json(NAME, self.transport.as_ref(), &self.profile, &request).await?;
        match read_reply(&response)? {
            Reply::Ok(id) => Ok(id),
            Reply::NotReady => Err(CaptchaError::Service {
                solver: NAME,
                message: "unexpected CAPCHA_NOT_READY on submit".into(),
            }),
        }
    }

    async fn check(&self, captcha_id: &str) -> Result<PollStatus<String>, CaptchaError> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("key", &self.api_key)
            .append_pair("action", "get")
            .append_pair("id", captcha_id)
            .append_pair("json", "1")
            .finish();
        let request = HttpRequest::get(format!("{}/res.php?{query}", self.base_url));

        let response = send_json(NAME, self.transport.as_ref(), &self.profile, &request).await?;
        Ok(match read_reply(&response)? {
            Reply::Ok(token) => PollStatus::Ready(token),
            Reply::NotReady => PollStatus::Pending,
        })
    }
}

enum Reply {
    Ok(String),
    NotReady,
}

/// `{"status": 1, "request": "<value>"}` or `{"status": 0, "request": "<code>"}`.
fn read_reply(body: &Value) -> Result<Reply, CaptchaError> {
    let status = body.get("status").and_then(Value::as_i64).unwrap_or(0);
    let request = body
        .get("request")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if status == 1 && !request.is_empty() {
        return Ok(Reply::Ok(request));
    }
    match request.as_str() {
        "CAPCHA_NOT_READY" => Ok(Reply::NotReady),
        "ERROR_ZERO_BALANCE" => Err(CaptchaError::InsufficientBalance { solver: NAME }),
        "" => Err(CaptchaError::Service {
            solver: NAME,
            message: format!("malformed reply: {body}"),
        }),
        code => Err(CaptchaError::Service {
            solver: NAME,
            message: code.to_string(),
        }),
    }
}

#[async_trait]
impl CaptchaSolver for TwoCaptchaSolver {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip_all, fields(solver = NAME))]
    async fn solve(&self, site_key: &str, page_url: &str) -> Result<CaptchaToken, CaptchaError> {
        let captcha_id = self.submit(site_key, page_url).await?;
        debug!("Submitted captcha {captcha_id}");

        let token = poll_until(NAME, self.timeout, self.poll_interval, || {
            self.check(&captcha_id)
        })
        .await?;
        Ok(CaptchaToken::new(token, NAME))
    }
}
