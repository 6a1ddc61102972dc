//! Types for the converter module.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::job::{Job, JobId, JobStage};

/// What a conversion service needs to know about a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub job_id: JobId,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
}

impl From<&Job> for ConversionRequest {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            input_path: job.input_path.clone(),
            output_dir: job.output_dir.clone(),
        }
    }
}

/// A progress report from the service for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: JobStage,
    /// Percent complete, already truncated to two decimals.
    pub percent: Option<f64>,
    pub message: Option<String>,
}

/// Status of the remote processing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteStatus {
    Processing {
        percent: Option<f64>,
        message: Option<String>,
    },
    /// Outputs can be fetched.
    Ready,
}

/// Result of materializing outputs into the job's output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedOutputs {
    pub output_dir: PathBuf,
    pub files: usize,
    pub bytes: u64,
}
