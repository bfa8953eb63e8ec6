use thiserror::Error;

/// Application-wide error types for CurtainTime.
#[derive(Error, Debug)]
pub enum AppError {
    /// Connection failure, reset, or 5xx from an upstream service.
    #[error("Network error: {0}")]
    Network(String),

    /// Request (or a whole attempt) timed out.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// Upstream asked us to slow down (HTTP 429).
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Upstream credit or quota is exhausted (HTTP 402 and friends).
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Credentials were rejected (HTTP 401/403).
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Upstream answered with something we could not decode.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Structured extraction from page content failed.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Invalid configuration (environment, source config, CLI input).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Schedule interval or time zone cannot be evaluated.
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// A referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// How the orchestrator should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient; resubmit with the normal backoff.
    Retryable,
    /// Transient but upstream-imposed; resubmit with the long backoff.
    RetryableLongBackoff,
    /// Record as failed-fatal immediately.
    Fatal,
}

impl AppError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            AppError::Network(_) | AppError::Timeout(_) | AppError::RateLimited => {
                FailureClass::Retryable
            }
            AppError::QuotaExceeded(_) => FailureClass::RetryableLongBackoff,
            _ => FailureClass::Fatal,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.failure_class() != FailureClass::Fatal
    }
}
