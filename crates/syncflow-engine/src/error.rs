//! Engine error taxonomy
//!
//! Per-record errors (`Validation`, `Transient`, `RateLimitExceeded`,
//! `AuthRefreshable`) never leave the entity processor except as a failed
//! outcome. `AuthFatal` and `Configuration` abort the job; `Orphaned` and
//! `Cancelled` end it without a failure record.

use thiserror::Error;

/// Result type alias for engine operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Pipeline stage an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Enrich,
    Route,
    Vectorize,
    Persist,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Enrich => "enrich",
            Stage::Route => "route",
            Stage::Vectorize => "vectorize",
            Stage::Persist => "persist",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine error
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Rate limit exceeded for {key} after waiting {waited_ms}ms")]
    RateLimitExceeded { key: String, waited_ms: u64 },

    #[error("Credential expired: {0}")]
    AuthRefreshable(String),

    #[error("Authentication failed permanently: {0}")]
    AuthFatal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Job orphaned: {0}")]
    Orphaned(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Stable label used in logs and failure records
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::Transient(_) => "transient",
            SyncError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            SyncError::AuthRefreshable(_) => "auth_refreshable",
            SyncError::AuthFatal(_) => "auth_fatal",
            SyncError::Configuration(_) => "configuration",
            SyncError::Orphaned(_) => "orphaned",
            SyncError::Cancelled => "cancelled",
            SyncError::Internal(_) => "internal",
        }
    }

    /// Whether the retry wrapper may try the call again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transient(_) | SyncError::RateLimitExceeded { .. }
        )
    }

    /// Whether the error must abort the whole job
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::AuthFatal(_) | SyncError::Configuration(_))
    }
}

impl From<syncflow_common::SyncflowError> for SyncError {
    fn from(err: syncflow_common::SyncflowError) -> Self {
        match err {
            syncflow_common::SyncflowError::InvalidRecord(msg) => SyncError::Validation(msg),
            syncflow_common::SyncflowError::Config(msg) => SyncError::Configuration(msg),
            other => SyncError::Internal(other.to_string()),
        }
    }
}

impl SyncError {
    /// Classify a non-success HTTP status from an external API
    pub fn from_status(status: reqwest::StatusCode, detail: impl std::fmt::Display) -> Self {
        let message = format!("HTTP {status}: {detail}");
        match status.as_u16() {
            429 => SyncError::Transient(message),
            401 => SyncError::AuthRefreshable(message),
            403 => SyncError::AuthFatal(message),
            400 | 413 | 422 => SyncError::Validation(message),
            _ if status.is_server_error() => SyncError::Transient(message),
            _ => SyncError::Internal(message),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return SyncError::Transient(err.to_string());
        }
        match err.status() {
            Some(status) => SyncError::from_status(status, &err),
            None => SyncError::Internal(err.to_string()),
        }
    }
}
