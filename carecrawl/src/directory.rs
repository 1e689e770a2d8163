//! Target-site protocol seam.
//!
//! The walker and fetcher only know how to page through listings and fetch
//! details; building requests and reading responses belongs to a
//! [`DirectoryApi`] implementation.
use crate::captcha::CaptchaToken;
use crate::executor::Rejection;
use crate::job::Job;
use carecrawl_config::{HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One provider summary from a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListingPage {
    pub records: Vec<ProviderRef>,
    /// Total hits for the query, when the API reports it.
    pub total_records: Option<u64>,
    /// Raw payload handed to the sink.
    pub payload: Value,
}

impl ListingPage {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Pagination position inside one walk. Pages are 1-based and only move
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingCursor {
    pub page_number: u32,
    pub has_more: bool,
}

impl ListingCursor {
    pub fn first() -> Self {
        Self {
            page_number: 1,
            has_more: true,
        }
    }

    /// Record offset of the current page.
    pub fn offset(&self, page_size: u32) -> u64 {
        u64::from(self.page_number.saturating_sub(1)) * u64::from(page_size)
    }

    pub fn advance(&mut self) {
        self.page_number += 1;
    }
}

pub trait DirectoryApi: Send + Sync {
    fn page_size(&self) -> u32;

    fn listing_request(&self, job: &Job, cursor: &ListingCursor, token: CaptchaToken) -> HttpRequest;

    fn parse_listing(&self, response: &HttpResponse) -> Result<ListingPage, Rejection>;

    fn detail_request(
        &self,
        job: &Job,
        provider: &ProviderRef,
        token: Option<CaptchaToken>,
    ) -> HttpRequest;

    fn parse_detail(&self, response: &HttpResponse) -> Result<Value, Rejection>;
}
