//! Error types recorded on a job.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use super::types::JobStage;

/// Coarse classification of a job failure, surfaced in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CacheCheck,
    Validation,
    TransientService,
    PermanentService,
    InsufficientDiskSpace,
    Upload,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheCheck => "cache_check",
            Self::Validation => "validation",
            Self::TransientService => "transient_service",
            Self::PermanentService => "permanent_service",
            Self::InsufficientDiskSpace => "insufficient_disk_space",
            Self::Upload => "upload",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// A failure recorded on a job.
///
/// Collaborator errors are folded into these variants by the executor and
/// dispatcher so the report only ever carries owned, cloneable data.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    /// The input file cannot be processed at all.
    #[error("invalid input {path}: {reason}")]
    Validation { path: PathBuf, reason: String },

    /// Not enough free space next to the output directory.
    #[error(
        "insufficient disk space at {path}: need {required_bytes} bytes, {available_bytes} available"
    )]
    InsufficientDiskSpace {
        path: PathBuf,
        required_bytes: u64,
        available_bytes: u64,
    },

    /// A retryable collaborator failure. `attempts` is how many times the
    /// stage had been tried when this was recorded.
    #[error("{stage} failed after {attempts} attempt(s): {message}")]
    TransientService {
        stage: JobStage,
        message: String,
        attempts: u32,
    },

    /// The conversion service rejected the work for good.
    #[error("{stage} failed permanently: {message}")]
    PermanentService { stage: JobStage, message: String },

    /// One or more output files could not be uploaded.
    #[error("{failed} of {total} file(s) failed to upload: {message}")]
    Upload {
        failed: usize,
        total: usize,
        message: String,
    },

    #[error("cancelled during {stage}")]
    Cancelled { stage: JobStage },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl JobError {
    pub fn validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::InsufficientDiskSpace { .. } => ErrorKind::InsufficientDiskSpace,
            Self::TransientService { .. } => ErrorKind::TransientService,
            Self::PermanentService { .. } => ErrorKind::PermanentService,
            Self::Upload { .. } => ErrorKind::Upload,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether re-attempting the same stage could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientService { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
