#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use carecrawl::captcha::{CaptchaSolver, CaptchaToken};
use carecrawl::directory::{DirectoryApi, ListingCursor, ListingPage, ProviderRef};
use carecrawl::executor::{Rejection, RequestExecutor, RetryPolicyBuilder};
use carecrawl::job::{Job, Plan, ServiceType};
use carecrawl::CaptchaError;
use carecrawl_config::{
    FixedHeaderProvider, HeaderProfile, HttpRequest, HttpResponse, HttpTransport,
    TransportError,
};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::net::TcpListener;

/// Request as seen by the test server.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: String,
}

pub struct Reply {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: vec![("content-type", "application/json".into())],
            body: body.to_string(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }
}

type Handler = Arc<dyn Fn(&Seen) -> Reply + Send + Sync>;

/// HTTP/1 server on an ephemeral port answering through `handler`.
pub struct TestServer {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl TestServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Seen) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        let log = log.clone();
                        async move {
                            let method = req.method().to_string();
                            let path = req.uri().path().to_string();
                            let query = req.uri().query().unwrap_or_default().to_string();
                            let body = req
                                .into_body()
                                .collect()
                                .await
                                .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                                .unwrap_or_default();
                            let seen = Seen {
                                method,
                                path,
                                query,
                                body,
                            };
                            let reply = handler(&seen);
                            log.lock().unwrap().push(seen);

                            let mut builder = Response::builder().status(reply.status);
                            for (name, value) in reply.headers {
                                builder = builder.header(name, value);
                            }
                            Ok::<_, Infallible>(
                                builder.body(Full::new(Bytes::from(reply.body))).unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, seen }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.requests().iter().filter(|s| s.path == path).count()
    }
}

pub fn profile() -> Arc<FixedHeaderProvider> {
    Arc::new(FixedHeaderProvider(Arc::new(HeaderProfile::for_user_agent(
        "Mozilla/5.0 (X11; Linux x86_64) Chrome/124.0.0.0 Safari/537.36",
        "en-US,en;q=0.9",
    ))))
}

pub fn fast_executor(transport: Arc<dyn HttpTransport>, max_attempts: u32) -> RequestExecutor {
    let policy = RetryPolicyBuilder::default()
        .max_attempts(max_attempts)
        .initial_interval(Duration::from_millis(5))
        .max_interval(Duration::from_millis(20))
        .jitter(0.0)
        .build()
        .unwrap();
    RequestExecutor::new(transport, profile(), policy)
}

type Route = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// In-process transport answering through a closure. Tracks how many
/// requests are in flight at once.
pub struct FakeTransport {
    route: Box<Route>,
    delay: Duration,
    requests: Mutex<Vec<HttpRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new<F>(route: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Self::with_delay(route, Duration::ZERO)
    }

    pub fn with_delay<F>(route: F, delay: Duration) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            route: Box::new(route),
            delay,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport").finish()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn send(
        &self,
        request: &HttpRequest,
        _profile: &HeaderProfile,
    ) -> Result<HttpResponse, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = (self.route)(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Solver handing out `<name>-<n>` tokens.
pub struct CountingSolver {
    pub name: &'static str,
    pub calls: AtomicUsize,
}

impl CountingSolver {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptchaSolver for CountingSolver {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn solve(&self, _site_key: &str, _page_url: &str) -> Result<CaptchaToken, CaptchaError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CaptchaToken::new(format!("{}-{n}", self.name), self.name))
    }
}

pub struct FailingSolver;

#[async_trait]
impl CaptchaSolver for FailingSolver {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn solve(&self, _: &str, _: &str) -> Result<CaptchaToken, CaptchaError> {
        Err(CaptchaError::Service {
            solver: "failing",
            message: "ERROR_CAPTCHA_UNSOLVABLE".into(),
        })
    }
}

/// Minimal JSON directory protocol:
/// - `GET fake://listing/<zip>/<specialty>?page=N&token=T`
///   -> `{"providers": ["id", ...], "total": n?}`
/// - `GET fake://detail/<id>` -> any JSON object
pub struct FakeApi {
    pub page_size: u32,
}

impl FakeApi {
    pub fn new(page_size: u32) -> Arc<Self> {
        Arc::new(Self { page_size })
    }
}

fn query_map(url: &str) -> HashMap<String, String> {
    url.split_once('?')
        .map(|(_, q)| {
            q.split('&')
                .filter_map(|kv| kv.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

pub fn listing_page(url: &str) -> u32 {
    query_map(url)
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}

pub fn listing_token(url: &str) -> Option<String> {
    query_map(url).get("token").cloned()
}

pub fn listing_zip(url: &str) -> String {
    url.trim_start_matches("fake://listing/")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

pub fn providers(ids: &[&str], total: Option<u64>) -> HttpResponse {
    let mut body = json!({ "providers": ids });
    if let Some(total) = total {
        body["total"] = json!(total);
    }
    HttpResponse::new(200, body.to_string())
}

impl DirectoryApi for FakeApi {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn listing_request(&self, job: &Job, cursor: &ListingCursor, token: CaptchaToken) -> HttpRequest {
        HttpRequest::get(format!(
            "fake://listing/{}/{}?page={}&token={}",
            job.zip_code,
            job.specialty,
            cursor.page_number,
            token.into_value()
        ))
    }

    fn parse_listing(&self, response: &HttpResponse) -> Result<ListingPage, Rejection> {
        let payload: Value = serde_json::from_str(&response.body)
            .map_err(|e| Rejection::Retry(e.to_string()))?;
        let ids = payload
            .get("providers")
            .and_then(Value::as_array)
            .ok_or_else(|| Rejection::Retry("no providers".into()))?;
        Ok(ListingPage {
            records: ids
                .iter()
                .filter_map(Value::as_str)
                .map(|id| ProviderRef {
                    id: id.to_string(),
                    name: None,
                })
                .collect(),
            total_records: payload.get("total").and_then(Value::as_u64),
            payload,
        })
    }

    fn detail_request(
        &self,
        _job: &Job,
        provider: &ProviderRef,
        token: Option<CaptchaToken>,
    ) -> HttpRequest {
        let mut request = HttpRequest::get(format!("fake://detail/{}", provider.id));
        if let Some(token) = token {
            request = request.header("x-captcha", token.into_value());
        }
        request
    }

    fn parse_detail(&self, response: &HttpResponse) -> Result<Value, Rejection> {
        serde_json::from_str(&response.body).map_err(|e| Rejection::Retry(e.to_string()))
    }
}

pub fn job(zip: &str, specialty: &str) -> Job {
    Job::new(
        zip,
        Plan {
            plan_type: "HIP".into(),
            network_code: "P1".into(),
            coverage_type: "M".into(),
        },
        specialty,
        ServiceType::Doctor,
    )
}
