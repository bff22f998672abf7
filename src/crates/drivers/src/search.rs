//! Web-search driver.
//!
//! The bundled implementation speaks the Tavily JSON API; any provider
//! returning (url, title, content) tuples fits behind the trait.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DriverError, Result};
use crate::retry::RetryPolicy;

/// One search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Result URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Snippet or extracted content.
    pub content: String,
}

/// Web-search capability consumed by the researcher subgraph.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run one query, returning at most `max_results` hits.
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>>;
}

/// Tavily search client.
#[derive(Clone)]
pub struct TavilyClient {
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
    client: Client,
}

impl TavilyClient {
    /// Client against the hosted endpoint.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, "https://api.tavily.com")
    }

    /// Client against a custom endpoint (tests, proxies).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DriverError::Config(format!("http client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            retry: RetryPolicy::default(),
            client,
        })
    }

    async fn search_once(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let request = SearchRequest {
            api_key: &self.api_key,
            query,
            max_results,
        };

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::from_status(status, body));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| DriverError::InvalidResponse(format!("search body: {e}")))?;

        Ok(parsed.results)
    }
}

#[async_trait]
impl SearchProvider for TavilyClient {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let retry = self.retry.clone();
        retry
            .run("search", || self.search_once(query, max_results))
            .await
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}
