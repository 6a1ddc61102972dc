//! Types for the progress module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::job::{ErrorKind, FailurePhase, JobId, JobStage, JobStatus};

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEventKind {
    Queued {
        input_path: PathBuf,
    },
    CacheHit {
        output_dir: PathBuf,
    },
    WaitingForSlot,
    StageStarted {
        stage: JobStage,
        attempt: u32,
    },
    StageProgress {
        stage: JobStage,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Retrying {
        stage: JobStage,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    UploadStarted {
        total: usize,
    },
    UploadProgress {
        file: String,
        done: usize,
        failed: usize,
        total: usize,
    },
    Finished {
        status: JobStatus,
        stage: JobStage,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure_phase: Option<FailurePhase>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// A timestamped event for one job, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProgressEventKind,
}

/// Latest known state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub input_path: PathBuf,
    pub stage: JobStage,
    pub status: JobStatus,
    /// Percent complete of the current stage, 0..=100.
    pub percent: f64,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_phase: Option<FailurePhase>,
    pub uploads_done: usize,
    pub uploads_failed: usize,
    pub uploads_total: usize,
    pub updated_at: DateTime<Utc>,
}

impl JobProgress {
    pub fn new(job_id: JobId, input_path: PathBuf) -> Self {
        Self {
            job_id,
            input_path,
            stage: JobStage::Queued,
            status: JobStatus::Pending,
            percent: 0.0,
            attempt: 0,
            message: None,
            error: None,
            error_kind: None,
            failure_phase: None,
            uploads_done: 0,
            uploads_failed: 0,
            uploads_total: 0,
            updated_at: Utc::now(),
        }
    }

    /// One status line, as printed by the periodic status log.
    pub fn status_line(&self) -> String {
        let detail = self
            .error
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or(self.stage.as_str());
        format!(
            "{}: {:.2}% - {} ({})",
            self.job_id, self.percent, detail, self.status
        )
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.skipped
    }

    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Point-in-time copy of every job's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub jobs: BTreeMap<JobId, JobProgress>,
    /// Average of every job's percent.
    pub overall_percent: f64,
    pub counts: StatusCounts,
    pub taken_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn get(&self, job_id: &JobId) -> Option<&JobProgress> {
        self.jobs.get(job_id)
    }

    pub fn is_finished(&self) -> bool {
        self.counts.total() > 0 && self.counts.finished() == self.counts.total()
    }

    /// Number of jobs currently in an active stage.
    pub fn active_jobs(&self) -> usize {
        self.jobs
            .values()
            .filter(|p| !p.status.is_terminal() && p.stage.is_active())
            .count()
    }
}
