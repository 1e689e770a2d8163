//! HTTP primitives shared by the request executor and the solvers.
//!
//! [`ReqwestTransport`] keeps one pooled `reqwest::Client` per proxy URI and
//! asks its [`ProxyProvider`] for a proxy on every send, so rotation applies
//! per attempt while connections are still reused.
use crate::headers::HeaderProfile;
use crate::proxy::{ProxyConfig, ProxyProvider};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER, USER_AGENT};
use std::{collections::HashMap, fmt, sync::Mutex, time::Duration};

pub use reqwest::Method;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Header lookup, names are stored lowercase.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `Retry-After` expressed in seconds. HTTP-date values are ignored.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header(RETRY_AFTER.as_str())?
            .trim()
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connection error: {0}")]
    Connect(String),
    #[error("request error: {0}")]
    Request(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl TransportError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_builder() {
            Self::Invalid(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Sends one HTTP request, no retries.
#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    async fn send(
        &self,
        request: &HttpRequest,
        profile: &HeaderProfile,
    ) -> Result<HttpResponse, TransportError>;
}

/// Parameters for configuring an HTTP client.
#[derive(Debug, Clone, Copy)]
pub struct HttpClientParams {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpClientParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Builds a client with TLS, timeouts and an optional proxy.
///
/// System proxy variables are ignored: the proxy is always explicit.
pub fn build_http_client(
    params: HttpClientParams,
    proxy_uri: Option<&str>,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut client_builder = reqwest::ClientBuilder::new()
        .use_rustls_tls()
        .timeout(params.timeout)
        .connect_timeout(params.connect_timeout)
        .no_proxy();

    if let Some(proxy_uri) = proxy_uri {
        client_builder = client_builder.proxy(reqwest::Proxy::all(proxy_uri)?);
    }

    client_builder.build()
}

#[derive(Debug)]
pub struct ReqwestTransport {
    params: HttpClientParams,
    proxies: Box<dyn ProxyProvider>,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new(params: HttpClientParams, proxy: &ProxyConfig) -> Self {
        Self {
            params,
            proxies: proxy.provider(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy_uri: Option<String>) -> Result<reqwest::Client, TransportError> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| TransportError::Invalid("client pool lock poisoned".into()))?;
        if let Some(client) = clients.get(&proxy_uri) {
            return Ok(client.clone());
        }

        let client = build_http_client(self.params, proxy_uri.as_deref())?;
        clients.insert(proxy_uri, client.clone());
        Ok(client)
    }

    fn header_map(
        request: &HttpRequest,
        profile: &HeaderProfile,
    ) -> Result<HeaderMap, TransportError> {
        let mut map = HeaderMap::new();
        let user_agent = HeaderValue::from_str(&profile.user_agent)
            .map_err(|e| TransportError::Invalid(format!("user agent: {e}")))?;
        map.insert(USER_AGENT, user_agent);

        // Request headers come last so they override profile defaults.
        for (name, value) in profile.headers.iter().chain(request.headers.iter()) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Invalid(format!("header `{name}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Invalid(format!("header `{name}`: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &HttpRequest,
        profile: &HeaderProfile,
    ) -> Result<HttpResponse, TransportError> {
        let proxy_uri = self.proxies.get_proxy();
        let client = self.client_for(proxy_uri)?;

        let mut builder = client
            .request(request.method.clone(), &request.url)
            .headers(Self::header_map(request, profile)?);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
