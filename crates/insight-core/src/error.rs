use thiserror::Error;

/// Application-wide error types for the insight scraper.
#[derive(Error, Debug)]
pub enum AppError {
    /// Request or navigation timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The browser engine or one of its sessions misbehaved.
    #[error("Browser error: {0}")]
    BrowserError(String),

    /// Markup or payload could not be parsed.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    ///
    /// Rate limits never surface here: a 429 is absorbed by the backoff
    /// inside the fetcher and only skips the affected page.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::NetworkError(_) | AppError::Timeout(_))
    }
}
