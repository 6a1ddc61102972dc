//! Error types for the converter module.

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a conversion service.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// No usable CLI executable was found.
    #[error("conversion CLI not found (searched: {searched})")]
    ExecutableNotFound { searched: String },

    /// Input recording not found.
    #[error("input file not found: {path}")]
    InputNotFound { path: PathBuf },

    /// The CLI process could not be started.
    #[error("failed to start conversion CLI: {reason}")]
    Spawn { reason: String },

    /// Network failure talking to the service.
    #[error("network error: {reason}")]
    Network { reason: String },

    /// The service is overloaded and asked us to come back later.
    #[error("service busy: {reason}")]
    ServiceBusy { reason: String },

    /// The service refused the recording.
    #[error("recording rejected: {reason}")]
    Rejected { reason: String },

    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// The CLI exited unsuccessfully.
    #[error("conversion CLI failed: {reason}")]
    ProcessFailed {
        exit_code: Option<i32>,
        reason: String,
        transient: bool,
    },

    /// The service finished but produced no output directory.
    #[error("expected output not found: {path}")]
    OutputMissing { path: PathBuf },

    /// Output directory exists but lacks required files.
    #[error("output at {path} is incomplete, missing: {missing}")]
    OutputIncomplete { path: PathBuf, missing: String },

    #[error("{operation} timed out after {timeout_secs} seconds")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("conversion cancelled")]
    Cancelled,

    /// The service was asked to run a stage it does not drive.
    #[error("stage {stage} is not run by this service")]
    UnsupportedStage { stage: String },
}

impl ConversionError {
    pub fn process_failed(exit_code: Option<i32>, reason: impl Into<String>, transient: bool) -> Self {
        Self::ProcessFailed {
            exit_code,
            reason: reason.into(),
            transient,
        }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn service_busy(reason: impl Into<String>) -> Self {
        Self::ServiceBusy {
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same stage could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::ServiceBusy { .. }
            | Self::Timeout { .. }
            | Self::Io(_) => true,
            Self::ProcessFailed { transient, .. } => *transient,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ConversionError::network("connection reset").is_retryable());
        assert!(ConversionError::service_busy("429").is_retryable());
        assert!(ConversionError::Timeout {
            operation: "hashing".to_string(),
            timeout_secs: 10
        }
        .is_retryable());
        assert!(ConversionError::process_failed(Some(1), "503", true).is_retryable());

        assert!(!ConversionError::process_failed(Some(2), "bad vrs", false).is_retryable());
        assert!(!ConversionError::rejected("corrupt").is_retryable());
        assert!(!ConversionError::AuthenticationFailed {
            reason: "bad password".to_string()
        }
        .is_retryable());
        assert!(!ConversionError::Cancelled.is_retryable());
        assert!(!ConversionError::OutputIncomplete {
            path: PathBuf::from("/o"),
            missing: "slam/summary.json".to_string()
        }
        .is_retryable());
    }
}
