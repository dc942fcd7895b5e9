//! Error types for Syncflow

use thiserror::Error;

/// Result type alias for Syncflow shared operations
pub type Result<T> = std::result::Result<T, SyncflowError>;

/// Main error type for the shared crate
#[derive(Error, Debug)]
pub enum SyncflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
