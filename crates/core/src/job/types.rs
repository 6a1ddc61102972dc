//! Types for the job module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::error::JobError;

/// Stable job identifier derived from the resolved input path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Derives the id from an input path: `<stem>-<first 12 hex chars of sha256(path)>`.
    pub fn from_path(path: &Path) -> Self {
        let digest = format!("{:x}", Sha256::digest(path.to_string_lossy().as_bytes()));
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "recording".to_string());
        Self(format!("{}-{}", stem, &digest[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Pipeline stage, in fixed forward order.
///
/// The derived `Ord` follows declaration order, so `a < b` means `a` comes
/// before `b` in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Hashing,
    HealthCheck,
    Encrypting,
    UploadingToService,
    RemoteProcessing,
    FetchingOutputs,
    Completed,
}

impl JobStage {
    /// The conversion stages a cache-miss job runs through, in order.
    pub const CONVERSION: [JobStage; 6] = [
        JobStage::Hashing,
        JobStage::HealthCheck,
        JobStage::Encrypting,
        JobStage::UploadingToService,
        JobStage::RemoteProcessing,
        JobStage::FetchingOutputs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Hashing => "hashing",
            Self::HealthCheck => "health_check",
            Self::Encrypting => "encrypting",
            Self::UploadingToService => "uploading_to_service",
            Self::RemoteProcessing => "remote_processing",
            Self::FetchingOutputs => "fetching_outputs",
            Self::Completed => "completed",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<JobStage> {
        match self {
            Self::Queued => Some(Self::Hashing),
            Self::Hashing => Some(Self::HealthCheck),
            Self::HealthCheck => Some(Self::Encrypting),
            Self::Encrypting => Some(Self::UploadingToService),
            Self::UploadingToService => Some(Self::RemoteProcessing),
            Self::RemoteProcessing => Some(Self::FetchingOutputs),
            Self::FetchingOutputs => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    /// Whether a job in this stage holds a concurrency slot.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Queued | Self::Completed)
    }

    /// Local CPU/IO-bound stages run on this machine.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Hashing | Self::HealthCheck | Self::Encrypting)
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Complete output already existed.
    CacheHit,
}

/// Overall status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped(SkipReason::CacheHit) => "skipped_cache_hit",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a run does with each input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingMode {
    #[serde(rename = "convert_upload", alias = "convert+upload")]
    ConvertAndUpload,
    #[serde(rename = "convert_only", alias = "convert-only")]
    ConvertOnly,
    #[serde(rename = "upload_only", alias = "upload-only")]
    UploadOnly,
}

impl ProcessingMode {
    pub fn includes_conversion(&self) -> bool {
        matches!(self, Self::ConvertAndUpload | Self::ConvertOnly)
    }

    pub fn includes_upload(&self) -> bool {
        matches!(self, Self::ConvertAndUpload | Self::UploadOnly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConvertAndUpload => "convert_upload",
            Self::ConvertOnly => "convert_only",
            Self::UploadOnly => "upload_only",
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of the pipeline a failed job failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Conversion,
    Upload,
}

/// Status of a single output file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Done,
    Failed,
}

/// One output file on its way to the object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub local_path: PathBuf,
    /// Bucket-relative object key.
    pub remote_key: String,
    pub status: UploadStatus,
    pub bytes_transferred: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadTask {
    pub fn new(local_path: PathBuf, remote_key: String) -> Self {
        Self {
            local_path,
            remote_key,
            status: UploadStatus::Pending,
            bytes_transferred: 0,
            attempts: 0,
            error: None,
        }
    }
}

/// One input file tracked through conversion and upload.
///
/// A job is owned by the task processing it; nothing else mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub stage: JobStage,
    pub status: JobStatus,
    /// Failed attempts of the current stage.
    pub attempt: u32,
    pub last_error: Option<JobError>,
    pub failure_phase: Option<FailurePhase>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_files: Vec<UploadTask>,
    /// Every stage entered, in order.
    pub stage_history: Vec<JobStage>,
}

impl Job {
    pub fn new(input_path: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            id: JobId::from_path(&input_path),
            input_path,
            output_dir,
            stage: JobStage::Queued,
            status: JobStatus::Pending,
            attempt: 0,
            last_error: None,
            failure_phase: None,
            started_at: None,
            finished_at: None,
            output_files: Vec::new(),
            stage_history: vec![JobStage::Queued],
        }
    }

    /// Marks the job as running. Idempotent.
    pub fn mark_running(&mut self) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Advances to `next`, which must come strictly after the current stage.
    pub fn enter_stage(&mut self, next: JobStage) {
        debug_assert!(
            next > self.stage,
            "stage must advance forward: {} -> {}",
            self.stage,
            next
        );
        if next <= self.stage {
            warn!(job_id = %self.id, from = %self.stage, to = %next, "Ignoring backward stage transition");
            return;
        }
        self.stage = next;
        self.attempt = 0;
        self.stage_history.push(next);
    }

    /// Records a failed attempt of the current stage and returns the new count.
    pub fn record_attempt_failure(&mut self, error: JobError) -> u32 {
        self.attempt += 1;
        self.last_error = Some(error);
        self.attempt
    }

    pub fn succeed(&mut self) {
        self.finish(JobStatus::Succeeded);
    }

    pub fn skip_cache_hit(&mut self) {
        self.finish(JobStatus::Skipped(SkipReason::CacheHit));
    }

    pub fn fail(&mut self, error: JobError, phase: FailurePhase) {
        if self.status.is_terminal() {
            warn!(job_id = %self.id, status = %self.status, "Job already terminal, ignoring failure: {}", error);
            return;
        }
        self.last_error = Some(error);
        self.failure_phase = Some(phase);
        self.finish(JobStatus::Failed);
    }

    fn finish(&mut self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            warn!(job_id = %self.id, current = %self.status, requested = %status, "Job already terminal");
            return;
        }
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Wall-clock duration between start and finish, when both are known.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }

    /// Human-readable summary of why the job did not succeed.
    pub fn error_summary(&self) -> Option<String> {
        if self.status == JobStatus::Failed {
            let phase = match self.failure_phase {
                Some(FailurePhase::Upload) => "upload",
                _ => "conversion",
            };
            let reason = self
                .last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            Some(format!("{} failed: {}", phase, reason))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> Job {
        Job::new(
            PathBuf::from("/data/session_01.vrs"),
            PathBuf::from("/data/mps_session_01_vrs"),
        )
    }

    #[test]
    fn test_job_id_is_stable_and_readable() {
        let a = JobId::from_path(Path::new("/data/session_01.vrs"));
        let b = JobId::from_path(Path::new("/data/session_01.vrs"));
        let c = JobId::from_path(Path::new("/other/session_01.vrs"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("session_01-"));
        assert_eq!(a.as_str().len(), "session_01-".len() + 12);
    }

    #[test]
    fn test_stage_order() {
        assert!(JobStage::Queued < JobStage::Hashing);
        assert!(JobStage::RemoteProcessing < JobStage::FetchingOutputs);
        assert_eq!(JobStage::FetchingOutputs.next(), Some(JobStage::Completed));
        assert_eq!(JobStage::Completed.next(), None);

        let mut stage = JobStage::Queued;
        for expected in JobStage::CONVERSION {
            stage = stage.next().unwrap();
            assert_eq!(stage, expected);
        }
    }

    #[test]
    fn test_enter_stage_resets_attempt() {
        let mut job = test_job();
        job.enter_stage(JobStage::Hashing);
        job.record_attempt_failure(JobError::Internal {
            message: "boom".to_string(),
        });
        assert_eq!(job.attempt, 1);

        job.enter_stage(JobStage::HealthCheck);
        assert_eq!(job.attempt, 0);
        assert_eq!(
            job.stage_history,
            vec![JobStage::Queued, JobStage::Hashing, JobStage::HealthCheck]
        );
    }

    #[test]
    fn test_terminal_status_is_set_once() {
        let mut job = test_job();
        job.mark_running();
        job.succeed();
        let finished_at = job.finished_at;

        job.fail(
            JobError::Internal {
                message: "late".to_string(),
            },
            FailurePhase::Conversion,
        );

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.finished_at, finished_at);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_error_summary_names_phase() {
        let mut job = test_job();
        job.fail(
            JobError::Upload {
                failed: 1,
                total: 3,
                message: "HTTP 403".to_string(),
            },
            FailurePhase::Upload,
        );

        let summary = job.error_summary().unwrap();
        assert!(summary.starts_with("upload failed"));
        assert!(summary.contains("1 of 3"));
    }

    #[test]
    fn test_mode_serialization() {
        let mode: ProcessingMode = serde_json::from_str("\"convert_upload\"").unwrap();
        assert_eq!(mode, ProcessingMode::ConvertAndUpload);
        let mode: ProcessingMode = serde_json::from_str("\"upload-only\"").unwrap();
        assert_eq!(mode, ProcessingMode::UploadOnly);
        assert!(!mode.includes_conversion());
        assert!(ProcessingMode::ConvertOnly.includes_conversion());
        assert!(!ProcessingMode::ConvertOnly.includes_upload());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&JobStatus::Skipped(SkipReason::CacheHit)).unwrap();
        assert_eq!(json, r#"{"skipped":"cache_hit"}"#);
        assert!(JobStatus::Skipped(SkipReason::CacheHit).is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
