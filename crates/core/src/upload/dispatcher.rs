//! Uploads a job's output directory to the object store.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::keys::remote_key;
use crate::executor::run_with_deadline;
use crate::job::{Job, JobError, UploadStatus, UploadTask};
use crate::metrics;
use crate::progress::{ProgressAggregator, ProgressEventKind};
use crate::retry::RetryPolicy;
use crate::storage::{ObjectStore, StorageError};

/// Outcome of uploading one job's outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub bytes: u64,
}

impl UploadReport {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done == self.total
    }
}

/// Upload settings for one run.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Files of one job uploaded at the same time.
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub folder_prefix: Option<String>,
}

/// Hands every file of a job's output directory to the object store.
///
/// Not bounded by the concurrency gate; `concurrency` caps uploads within
/// one job. Each file is retried on its own, so one failure does not
/// affect its siblings.
pub struct UploadDispatcher {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    settings: UploadSettings,
    progress: Arc<ProgressAggregator>,
}

impl UploadDispatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        retry: RetryPolicy,
        settings: UploadSettings,
        progress: Arc<ProgressAggregator>,
    ) -> Self {
        Self {
            store,
            retry,
            settings,
            progress,
        }
    }

    /// Uploads everything under `job.output_dir`, storing per-file outcomes
    /// in `job.output_files`.
    ///
    /// Returns `JobError::Upload` unless every file reached `Done`, and
    /// `JobError::Cancelled` if `cancel` fired.
    pub async fn dispatch(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, JobError> {
        let files = collect_files(&job.output_dir)?;
        if files.is_empty() {
            return Err(JobError::Upload {
                failed: 0,
                total: 0,
                message: format!("no files found in directory {}", job.output_dir.display()),
            });
        }

        let prefix = self.settings.folder_prefix.as_deref();
        let tasks: Vec<UploadTask> = files
            .into_iter()
            .map(|file| {
                let key = remote_key(prefix, &job.output_dir, &file);
                UploadTask::new(file, key)
            })
            .collect();

        let total = tasks.len();
        info!(job_id = %job.id, files = total, "Uploading outputs");
        self.progress
            .record(&job.id, ProgressEventKind::UploadStarted { total });

        let mut report = UploadReport {
            total,
            ..Default::default()
        };
        let mut finished = Vec::with_capacity(total);
        let mut uploads = stream::iter(tasks)
            .map(|task| self.upload_one(task, cancel))
            .buffer_unordered(self.settings.concurrency.max(1));

        while let Some(task) = uploads.next().await {
            match task.status {
                UploadStatus::Done => {
                    report.done += 1;
                    report.bytes += task.bytes_transferred;
                }
                _ => report.failed += 1,
            }
            self.progress.record(
                &job.id,
                ProgressEventKind::UploadProgress {
                    file: task.remote_key.clone(),
                    done: report.done,
                    failed: report.failed,
                    total,
                },
            );
            finished.push(task);
        }
        drop(uploads);

        finished.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));
        let first_error = finished.iter().find_map(|t| t.error.clone());
        job.output_files = finished;

        if cancel.is_cancelled() && !report.is_complete() {
            return Err(JobError::Cancelled { stage: job.stage });
        }
        if report.failed > 0 {
            return Err(JobError::Upload {
                failed: report.failed,
                total,
                message: first_error.unwrap_or_else(|| "upload failed".to_string()),
            });
        }

        info!(job_id = %job.id, files = total, bytes = report.bytes, "Upload complete");
        Ok(report)
    }

    async fn upload_one(&self, mut task: UploadTask, cancel: &CancellationToken) -> UploadTask {
        task.status = UploadStatus::Uploading;
        loop {
            task.attempts += 1;
            let result = run_with_deadline(
                self.store.upload(&task.local_path, &task.remote_key),
                self.settings.request_timeout,
                cancel,
                "upload",
            )
            .await;

            let error = match result {
                Ok(bytes) => {
                    debug!(key = %task.remote_key, bytes, "Uploaded");
                    metrics::UPLOADS_TOTAL.with_label_values(&["done"]).inc();
                    task.bytes_transferred = bytes;
                    task.status = UploadStatus::Done;
                    task.error = None;
                    return task;
                }
                Err(e) => e,
            };

            let decision = match error {
                StorageError::Cancelled => crate::retry::RetryDecision::GIVE_UP,
                _ => self.retry.decide(task.attempts, &error),
            };
            if !decision.retry {
                warn!(key = %task.remote_key, attempts = task.attempts, "Upload failed: {}", error);
                metrics::UPLOADS_TOTAL.with_label_values(&["failed"]).inc();
                task.status = UploadStatus::Failed;
                task.error = Some(format!("{}: {}", task.remote_key, error));
                return task;
            }

            warn!(
                key = %task.remote_key,
                attempt = task.attempts,
                backoff_ms = decision.backoff.as_millis() as u64,
                "Upload failed, retrying: {}",
                error
            );
            metrics::UPLOADS_TOTAL.with_label_values(&["retried"]).inc();
            tokio::select! {
                _ = cancel.cancelled() => {
                    task.status = UploadStatus::Failed;
                    task.error = Some(format!("{}: {}", task.remote_key, StorageError::Cancelled));
                    return task;
                }
                _ = tokio::time::sleep(decision.backoff) => {}
            }
        }
    }
}

/// Every regular file under `dir`, sorted.
fn collect_files(dir: &Path) -> Result<Vec<PathBuf>, JobError> {
    if !dir.is_dir() {
        return Err(JobError::Upload {
            failed: 0,
            total: 0,
            message: format!("output directory not found: {}", dir.display()),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| JobError::Upload {
            failed: 0,
            total: 0,
            message: format!("cannot list {}: {}", dir.display(), e),
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}
