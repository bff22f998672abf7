//! Error types for external drivers.
//!
//! Every driver failure is classified as transient (worth retrying) or
//! permanent before it leaves this crate. Drivers run their own bounded
//! retries for transient failures; whatever escapes is converted into
//! the engine's taxonomy via `From<DriverError> for GraphError`.

use graphflow_core::GraphError;
use thiserror::Error;

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors raised by LLM, search, and market-catalog drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Underlying HTTP request failed (connect, timeout, body read).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider rate-limited the request.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// The provider returned a 5xx.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The request timed out at the application level.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Authentication failed or no credential is configured.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The provider rejected the request (4xx other than 429).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The response could not be parsed, including structured output
    /// that stayed unparseable after retries.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Driver configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::RateLimited(_)
            | DriverError::ServiceUnavailable(_)
            | DriverError::Timeout(_) => true,
            DriverError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }

    /// Classify an HTTP status into the taxonomy.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            DriverError::RateLimited(body)
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            DriverError::Authentication(body)
        } else if status.is_server_error() {
            DriverError::ServiceUnavailable(format!("{status}: {body}"))
        } else {
            DriverError::InvalidRequest(format!("{status}: {body}"))
        }
    }
}

impl From<DriverError> for GraphError {
    fn from(err: DriverError) -> Self {
        if err.is_retryable() {
            GraphError::TransientDriver(err.to_string())
        } else {
            GraphError::PermanentDriver(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_status() {
        assert!(matches!(
            DriverError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new()),
            DriverError::RateLimited(_)
        ));
        assert!(matches!(
            DriverError::from_status(reqwest::StatusCode::BAD_GATEWAY, String::new()),
            DriverError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            DriverError::from_status(reqwest::StatusCode::BAD_REQUEST, String::new()),
            DriverError::InvalidRequest(_)
        ));
    }

    #[test]
    fn retryability_maps_to_engine_taxonomy() {
        let transient: GraphError = DriverError::RateLimited("slow down".to_string()).into();
        assert!(matches!(transient, GraphError::TransientDriver(_)));

        let permanent: GraphError = DriverError::InvalidResponse("bad json".to_string()).into();
        assert!(matches!(permanent, GraphError::PermanentDriver(_)));
    }
}
