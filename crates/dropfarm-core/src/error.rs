//! Error types for the `dropfarm` core library.

use thiserror::Error;

/// Result type alias using the core [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error types for configuration and persistence.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database record error
    #[error("Database error: {0}")]
    Database(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
