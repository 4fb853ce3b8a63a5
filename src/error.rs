use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Rejected input (bad user id, empty or oversized message)
    #[error("validation error: {0}")]
    Validation(String),

    /// Transient language-provider failure, safe to retry
    #[error("provider error: {0}")]
    Provider(String),

    /// Provider responded but the payload was unusable
    #[error("malformed provider response: {0}")]
    Malformed(String),

    /// Reply generation failed after exhausting retries
    #[error("reply generation unavailable: {0}")]
    GenerationUnavailable(String),

    /// A pipeline stage exceeded its time budget
    #[error("timed out during {0}")]
    Timeout(String),

    /// Database errors
    #[error("database error: {0}")]
    Database(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client errors
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite errors
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether a retry might succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::Timeout(_))
    }
}

/// Convenience result type
pub type Result<T> = std::result::Result<T, Error>;
