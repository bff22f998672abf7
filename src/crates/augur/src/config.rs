//! Environment-driven configuration.

use std::path::PathBuf;

/// Default supervisor iteration cap.
pub const DEFAULT_ITERATION_CAP: u32 = 10;

/// Default conversation-history hard cap.
pub const DEFAULT_HISTORY_CAP: usize = 50;

/// Default number of fallback candidates when a market LLM stage
/// returns an empty set.
pub const DEFAULT_MARKET_FALLBACK: usize = 3;

/// Runtime settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Persistence DSN. Absent means in-memory stores: no cross-process
    /// thread listing, but every in-process semantic is identical.
    pub database_url: Option<String>,

    /// Model id used by the supervisor and the report writer.
    pub supervisor_model: String,

    /// Model id used for thread-name generation.
    pub thread_name_model: String,

    /// Sampling temperature for both models.
    pub temperature: f32,

    /// Bounded retry count for LLM calls.
    pub llm_retries: usize,

    /// Chat-completions API key.
    pub llm_api_key: Option<String>,

    /// Web-search provider API key.
    pub search_api_key: Option<String>,

    /// Prediction-market catalog base URL.
    pub market_base_url: String,

    /// Where to dump terminal run states for debugging, if anywhere.
    pub state_log_dir: Option<PathBuf>,

    /// Supervisor re-entry cap per run.
    pub iteration_cap: u32,

    /// Conversation-history hard cap.
    pub history_cap: usize,

    /// Market fallback size.
    pub market_fallback: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            supervisor_model: "gpt-4o".to_string(),
            thread_name_model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            llm_retries: 3,
            llm_api_key: None,
            search_api_key: None,
            market_base_url: "https://gamma-api.polymarket.com".to_string(),
            state_log_dir: None,
            iteration_cap: DEFAULT_ITERATION_CAP,
            history_cap: DEFAULT_HISTORY_CAP,
            market_fallback: DEFAULT_MARKET_FALLBACK,
        }
    }
}

impl Settings {
    /// Read settings from `AUGUR_*` (and provider-conventional)
    /// environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("AUGUR_DATABASE_URL").ok(),
            supervisor_model: env_or("AUGUR_SUPERVISOR_MODEL", defaults.supervisor_model),
            thread_name_model: env_or("AUGUR_THREAD_NAME_MODEL", defaults.thread_name_model),
            temperature: parsed_env("AUGUR_LLM_TEMPERATURE", defaults.temperature),
            llm_retries: parsed_env("AUGUR_LLM_RETRIES", defaults.llm_retries),
            llm_api_key: std::env::var("OPENAI_API_KEY").ok(),
            search_api_key: std::env::var("TAVILY_API_KEY").ok(),
            market_base_url: env_or("AUGUR_MARKET_BASE_URL", defaults.market_base_url),
            state_log_dir: std::env::var("AUGUR_STATE_LOG_DIR").ok().map(PathBuf::from),
            iteration_cap: parsed_env("AUGUR_ITERATION_CAP", defaults.iteration_cap),
            history_cap: parsed_env("AUGUR_HISTORY_CAP", defaults.history_cap),
            market_fallback: parsed_env("AUGUR_MARKET_FALLBACK", defaults.market_fallback),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
