//! Prediction-market catalog driver.
//!
//! The bundled implementation speaks a Polymarket-Gamma-style REST API:
//! paginated tags, events by tag, and per-token price history. Markets
//! arrive nested inside events; the subgraph flattens them and attaches
//! the parent-event context before ranking.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{DriverError, Result};
use crate::retry::RetryPolicy;

/// A catalog tag (topic) markets are filed under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    /// Opaque tag id.
    pub id: String,
    /// Human-readable tag label.
    #[serde(alias = "label")]
    pub name: String,
}

/// A catalog event grouping one or more markets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    /// Event title.
    #[serde(default)]
    pub title: String,
    /// Event slug.
    #[serde(default)]
    pub slug: String,
    /// Event image URL.
    #[serde(default)]
    pub image: Option<String>,
    /// Markets contained in the event.
    #[serde(default)]
    pub markets: Vec<Market>,
}

/// One tradeable market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    /// Stable slug; the join key used everywhere downstream.
    pub slug: String,
    /// The market question.
    #[serde(default)]
    pub question: String,
    /// Longer description.
    #[serde(default)]
    pub description: Option<String>,
    /// Resolution rules.
    #[serde(default)]
    pub rules: Option<String>,
    /// Outcome token ids, kept verbatim for price-history lookups.
    #[serde(rename = "clobTokenIds", default)]
    pub clob_token_ids: Option<Value>,
    /// Title of the parent event, attached during flattening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_title: Option<String>,
    /// Slug of the parent event, attached during flattening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_slug: Option<String>,
    /// Image of the parent event, attached during flattening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_image: Option<String>,
    /// Recent price points, attached by the enrichment step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_history: Option<Vec<PricePoint>>,
}

/// One point of a price series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    /// Unix timestamp (seconds).
    pub t: i64,
    /// Price in `[0, 1]`.
    pub p: f64,
}

/// Prediction-market catalog capability.
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    /// One page of tags, `limit` per page.
    async fn fetch_tags(&self, offset: usize, limit: usize) -> Result<Vec<Tag>>;

    /// All events filed under a tag.
    async fn fetch_events_by_tag_id(&self, tag_id: &str) -> Result<Vec<MarketEvent>>;

    /// Recent price history of one outcome token.
    async fn fetch_price_history(
        &self,
        token_id: &str,
        interval: &str,
        fidelity: u32,
    ) -> Result<Vec<PricePoint>>;
}

/// Gamma-style catalog client.
#[derive(Clone)]
pub struct GammaClient {
    base_url: String,
    retry: RetryPolicy,
    client: Client,
}

impl GammaClient {
    /// Client against the given catalog base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DriverError::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            retry: RetryPolicy::default(),
            client,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::from_status(status, body));
        }
        response
            .json()
            .await
            .map_err(|e| DriverError::InvalidResponse(format!("catalog body: {e}")))
    }
}

#[async_trait]
impl MarketCatalog for GammaClient {
    async fn fetch_tags(&self, offset: usize, limit: usize) -> Result<Vec<Tag>> {
        let url = format!("{}/tags?offset={offset}&limit={limit}", self.base_url);
        let retry = self.retry.clone();
        retry.run("market.fetch_tags", || self.get_json(url.clone())).await
    }

    async fn fetch_events_by_tag_id(&self, tag_id: &str) -> Result<Vec<MarketEvent>> {
        let url = format!("{}/events?tag_id={tag_id}&closed=false", self.base_url);
        let retry = self.retry.clone();
        retry
            .run("market.fetch_events", || self.get_json(url.clone()))
            .await
    }

    async fn fetch_price_history(
        &self,
        token_id: &str,
        interval: &str,
        fidelity: u32,
    ) -> Result<Vec<PricePoint>> {
        let url = format!(
            "{}/prices-history?market={token_id}&interval={interval}&fidelity={fidelity}",
            self.base_url
        );
        let retry = self.retry.clone();
        let response: PriceHistoryResponse = retry
            .run("market.price_history", || self.get_json(url.clone()))
            .await?;
        Ok(response.history)
    }
}

#[derive(Debug, Deserialize)]
struct PriceHistoryResponse {
    #[serde(default)]
    history: Vec<PricePoint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn market_deserializes_gamma_shape() {
        let market: Market = serde_json::from_value(json!({
            "slug": "will-it-rain",
            "question": "Will it rain tomorrow?",
            "clobTokenIds": "[\"123\", \"456\"]"
        }))
        .unwrap();
        assert_eq!(market.slug, "will-it-rain");
        assert!(market.clob_token_ids.is_some());
        assert!(market.event_title.is_none());
    }

    #[test]
    fn tag_accepts_label_alias() {
        let tag: Tag = serde_json::from_value(json!({"id": "7", "label": "Politics"})).unwrap();
        assert_eq!(tag.name, "Politics");
    }
}
