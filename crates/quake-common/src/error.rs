//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for shared operations
pub type Result<T> = std::result::Result<T, QuakeError>;

/// Errors raised by the shared message layer
#[derive(Error, Debug)]
pub enum QuakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown job status: {0}")]
    UnknownStatus(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
