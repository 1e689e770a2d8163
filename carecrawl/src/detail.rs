//! Provider detail fetching with provider-level dedup.
use crate::captcha::CaptchaProvider;
use crate::directory::{DirectoryApi, ProviderRef};
use crate::error::{CaptchaError, CrawlError};
use crate::executor::{Exchange, Rejection, RequestExecutor};
use crate::job::{provider_cache_key, Job};
use crate::sink::ArtifactSink;
use async_trait::async_trait;
use carecrawl_cache::DedupCache;
use carecrawl_config::{HttpRequest, HttpResponse};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailStatus {
    Fetched,
    AlreadySeen,
}

struct DetailExchange<'a> {
    api: &'a dyn DirectoryApi,
    captcha: Option<&'a CaptchaProvider>,
    job: &'a Job,
    provider: &'a ProviderRef,
}

#[async_trait]
impl<'a> Exchange for DetailExchange<'a> {
    type Output = Value;

    fn label(&self) -> String {
        format!("detail {}", self.provider.id)
    }

    async fn prepare(&self, _attempt: u32) -> Result<HttpRequest, CaptchaError> {
        let token = match self.captcha {
            Some(captcha) => Some(captcha.acquire().await?),
            None => None,
        };
        Ok(self.api.detail_request(self.job, self.provider, token))
    }

    fn accept(&self, response: HttpResponse) -> Result<Value, Rejection> {
        self.api.parse_detail(&response)
    }
}

#[derive(Clone)]
pub struct DetailFetcher {
    executor: RequestExecutor,
    api: Arc<dyn DirectoryApi>,
    /// Present only when the detail endpoint is challenge-protected.
    captcha: Option<CaptchaProvider>,
    sink: Arc<dyn ArtifactSink>,
    cache: Arc<dyn DedupCache>,
}

impl DetailFetcher {
    pub fn new(
        executor: RequestExecutor,
        api: Arc<dyn DirectoryApi>,
        captcha: Option<CaptchaProvider>,
        sink: Arc<dyn ArtifactSink>,
        cache: Arc<dyn DedupCache>,
    ) -> Self {
        Self {
            executor,
            api,
            captcha,
            sink,
            cache,
        }
    }

    /// Fetch and persist one provider's details unless an earlier run
    /// already did. The provider is marked seen only after the artifact
    /// is written.
    #[instrument(skip_all, fields(provider = %provider.id))]
    pub async fn fetch_detail(
        &self,
        job: &Job,
        provider: &ProviderRef,
    ) -> Result<DetailStatus, CrawlError> {
        let key = provider_cache_key(&provider.id);
        if self.cache.has(&key).await? {
            debug!("Provider {} already fetched", provider.id);
            return Ok(DetailStatus::AlreadySeen);
        }

        let exchange = DetailExchange {
            api: self.api.as_ref(),
            captcha: self.captcha.as_ref(),
            job,
            provider,
        };
        let payload = self.executor.run(&exchange).await?;
        self.sink.persist_detail(&provider.id, &payload).await?;
        self.cache.put(&key).await?;

        debug!("Provider {} saved", provider.id);
        Ok(DetailStatus::Fetched)
    }
}

impl std::fmt::Debug for DetailFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetailFetcher")
            .field("executor", &self.executor)
            .field("captcha", &self.captcha)
            .finish()
    }
}
