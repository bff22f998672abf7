//! # drivers
//!
//! Capability interfaces for augur's external collaborators, with HTTP
//! implementations:
//!
//! - [`ChatModel`](llm::ChatModel) - language model with plain and
//!   schema-guided structured completion ([`OpenAiClient`](llm::OpenAiClient))
//! - [`SearchProvider`](search::SearchProvider) - web search
//!   ([`TavilyClient`](search::TavilyClient))
//! - [`MarketCatalog`](market::MarketCatalog) - prediction-market tags,
//!   events, and price history ([`GammaClient`](market::GammaClient))
//!
//! Drivers classify failures as transient or permanent
//! ([`DriverError`]) and run their own bounded retries with exponential
//! backoff ([`RetryPolicy`]) before anything reaches the engine. Graph
//! nodes therefore treat a driver error as final for the current run.

pub mod error;
pub mod llm;
pub mod market;
pub mod retry;
pub mod search;

pub use error::{DriverError, Result};
pub use llm::{ChatModel, LlmConfig, OpenAiClient};
pub use market::{GammaClient, Market, MarketCatalog, MarketEvent, PricePoint, Tag};
pub use retry::RetryPolicy;
pub use search::{SearchHit, SearchProvider, TavilyClient};
