//! Error types for resort-queue
//!
//! Every fallible queue operation returns `QueueError`. Handler code
//! reports failures through [`HandlerError`](crate::delivery::HandlerError)
//! instead, because handler failures never escape `listen`.

use thiserror::Error;

/// Queue-wide error type
#[derive(Debug, Error)]
pub enum QueueError {
    /// Storage backend failure (usually transient)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schema setup failed; fatal for the caller that hit it
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// `listen` called while another listener runs on the same instance
    #[error("Queue is already listening")]
    AlreadyListening,

    /// The queue was disposed and no longer accepts work
    #[error("Queue has been disposed")]
    Disposed,

    /// Invalid input (delay out of range, malformed identifiers, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Outbound activity delivery failed
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<::config::ConfigError> for QueueError {
    fn from(err: ::config::ConfigError) -> Self {
        QueueError::Config(err.to_string())
    }
}

impl QueueError {
    /// Short, stable label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::Database(_) => "database",
            QueueError::Serialization(_) => "serialization",
            QueueError::Initialization(_) => "initialization",
            QueueError::AlreadyListening => "already_listening",
            QueueError::Disposed => "disposed",
            QueueError::Validation(_) => "validation",
            QueueError::Config(_) => "config",
            QueueError::Delivery(_) => "delivery",
            QueueError::HttpClient(_) => "http_client",
            QueueError::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::Database(_) | QueueError::HttpClient(_) | QueueError::Delivery(_)
        )
    }
}

/// Result type alias using QueueError
pub type Result<T> = std::result::Result<T, QueueError>;
