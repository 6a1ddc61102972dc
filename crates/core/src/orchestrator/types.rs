//! Types for the job orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::job::{ErrorKind, FailurePhase, Job, JobId, JobStage, JobStatus, ProcessingMode, UploadTask};
use crate::progress::StatusCounts;

/// Errors that reject a run before any job is created.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no input files given")]
    NoInputs,

    #[error("invalid concurrency limit: {0} (must be at least 1)")]
    InvalidConcurrency(usize),

    /// The mode uploads but no bucket is configured.
    #[error("object storage is not configured")]
    StorageNotConfigured,

    /// The bucket check failed.
    #[error("object storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Identifier of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A batch of inputs to process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub inputs: Vec<PathBuf>,
    pub mode: ProcessingMode,
    /// Overrides the configured default limit.
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    /// Overrides the configured output root.
    #[serde(default)]
    pub output_root: Option<PathBuf>,
    /// Overrides the configured folder prefix for object keys.
    #[serde(default)]
    pub folder_prefix: Option<String>,
}

impl RunRequest {
    pub fn new(inputs: Vec<PathBuf>, mode: ProcessingMode) -> Self {
        Self {
            inputs,
            mode,
            concurrency_limit: None,
            output_root: None,
            folder_prefix: None,
        }
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = Some(root.into());
        self
    }

    pub fn with_folder_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.folder_prefix = Some(prefix.into());
        self
    }
}

/// Final state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub status: JobStatus,
    pub stage: JobStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_phase: Option<FailurePhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    /// Failed attempts of the stage the job ended in.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub uploads: Vec<UploadTask>,
}

impl From<&Job> for JobReport {
    fn from(job: &Job) -> Self {
        let failed = job.status == JobStatus::Failed;
        Self {
            job_id: job.id.clone(),
            input_path: job.input_path.clone(),
            output_dir: job.output_dir.clone(),
            status: job.status,
            stage: job.stage,
            failure_phase: job.failure_phase,
            error_kind: job
                .last_error
                .as_ref()
                .filter(|_| failed)
                .map(|e| e.kind()),
            error_summary: job.error_summary(),
            attempts: job.attempt,
            duration_ms: job.duration_ms(),
            uploads: job.output_files.clone(),
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub mode: ProcessingMode,
    pub jobs: Vec<JobReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Failed jobs whose conversion failed.
    pub conversion_failures: usize,
    /// Failed jobs whose conversion succeeded but upload did not.
    pub upload_failures: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn new(
        run_id: RunId,
        mode: ProcessingMode,
        mut jobs: Vec<JobReport>,
        started_at: DateTime<Utc>,
    ) -> Self {
        jobs.sort_by(|a, b| a.input_path.cmp(&b.input_path));

        let count = |pred: &dyn Fn(&JobReport) -> bool| jobs.iter().filter(|j| pred(j)).count();
        let succeeded = count(&|j| j.status == JobStatus::Succeeded);
        let failed = count(&|j| j.status == JobStatus::Failed);
        let skipped = count(&|j| matches!(j.status, JobStatus::Skipped(_)));
        let upload_failures = count(&|j| {
            j.status == JobStatus::Failed && j.failure_phase == Some(FailurePhase::Upload)
        });

        Self {
            run_id,
            mode,
            succeeded,
            failed,
            skipped,
            conversion_failures: failed - upload_failures,
            upload_failures,
            jobs,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn job(&self, job_id: &JobId) -> Option<&JobReport> {
        self.jobs.iter().find(|j| &j.job_id == job_id)
    }
}

/// Short description of a run, for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub mode: ProcessingMode,
    pub concurrency_limit: usize,
    pub counts: StatusCounts,
    pub overall_percent: f64,
    pub finished: bool,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobError, UploadStatus};

    fn job(name: &str) -> Job {
        Job::new(
            PathBuf::from(format!("/data/{}.vrs", name)),
            PathBuf::from(format!("/data/mps_{}_vrs", name)),
        )
    }

    #[test]
    fn test_report_counts_split_failure_phases() {
        let mut ok = job("a");
        ok.succeed();
        let mut cached = job("b");
        cached.skip_cache_hit();
        let mut conversion = job("c");
        conversion.fail(
            JobError::PermanentService {
                stage: JobStage::Encrypting,
                message: "rejected".to_string(),
            },
            FailurePhase::Conversion,
        );
        let mut upload = job("d");
        upload.fail(
            JobError::Upload {
                failed: 1,
                total: 5,
                message: "403".to_string(),
            },
            FailurePhase::Upload,
        );

        let jobs = [&ok, &cached, &conversion, &upload]
            .into_iter()
            .map(JobReport::from)
            .collect();
        let report = RunReport::new(RunId::new(), ProcessingMode::ConvertAndUpload, jobs, Utc::now());

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.conversion_failures, 1);
        assert_eq!(report.upload_failures, 1);

        let d = report.job(&upload.id).unwrap();
        assert_eq!(d.error_kind, Some(ErrorKind::Upload));
        assert!(d.error_summary.as_deref().unwrap().starts_with("upload failed"));
        assert!(report.job(&ok.id).unwrap().error_summary.is_none());
    }

    #[test]
    fn test_job_report_carries_upload_outcomes() {
        let mut j = job("e");
        let mut task = UploadTask::new(
            PathBuf::from("/data/mps_e_vrs/slam/summary.json"),
            "mps_e_vrs/slam/summary.json".to_string(),
        );
        task.status = UploadStatus::Failed;
        task.attempts = 4;
        task.error = Some("HTTP 503".to_string());
        j.output_files.push(task.clone());

        let report = JobReport::from(&j);
        assert_eq!(report.uploads, vec![task]);

        let json = serde_json::to_string(&report).unwrap();
        let parsed: JobReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            OrchestratorError::InvalidConcurrency(0).to_string(),
            "invalid concurrency limit: 0 (must be at least 1)"
        );
        assert_eq!(
            OrchestratorError::StorageUnavailable("bucket does not exist".to_string()).to_string(),
            "object storage unavailable: bucket does not exist"
        );
    }

    #[test]
    fn test_run_request_deserialize() {
        let json = r#"{"inputs": ["/a.vrs"], "mode": "convert+upload"}"#;
        let request: RunRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.mode, ProcessingMode::ConvertAndUpload);
        assert!(request.concurrency_limit.is_none());
    }
}
