use std::path::PathBuf;
use thiserror::Error;

/// Errors from the object store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage not configured: {0}")]
    NotConfigured(String),

    #[error("bucket {bucket} unavailable: {reason}")]
    BucketUnavailable { bucket: String, reason: String },

    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload cancelled")]
    Cancelled,
}

impl StorageError {
    /// Network failures, timeouts, 408, 429 and 5xx responses are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl crate::retry::Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        StorageError::is_retryable(self)
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Self::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            Self::Network(e.to_string())
        }
    }
}
