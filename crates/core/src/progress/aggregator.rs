use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::types::{JobProgress, ProgressEvent, ProgressEventKind, ProgressSnapshot, StatusCounts};
use crate::job::{FailurePhase, JobId, JobStage, JobStatus};

/// Thread-safe sink of per-job progress events.
///
/// Writers update one map entry at a time under that entry's shard lock, so
/// concurrent jobs never lose each other's updates and a snapshot never
/// blocks writers for longer than one entry copy. Every accepted event is
/// also broadcast to subscribers.
#[derive(Debug)]
pub struct ProgressAggregator {
    jobs: DashMap<JobId, JobProgress>,
    events_tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressAggregator {
    pub fn new(event_buffer: usize) -> Self {
        let (events_tx, _) = broadcast::channel(event_buffer.max(16));
        Self {
            jobs: DashMap::new(),
            events_tx,
        }
    }

    /// Starts tracking a job in `Pending`.
    pub fn register(&self, job_id: &JobId, input_path: PathBuf) {
        self.jobs
            .entry(job_id.clone())
            .or_insert_with(|| JobProgress::new(job_id.clone(), input_path.clone()));
        self.record(job_id, ProgressEventKind::Queued { input_path });
    }

    /// Applies an event to the job's entry and broadcasts it.
    ///
    /// Events for jobs that already reached a terminal status are dropped.
    pub fn record(&self, job_id: &JobId, kind: ProgressEventKind) {
        {
            let mut entry = match self.jobs.get_mut(job_id) {
                Some(entry) => entry,
                None => {
                    debug!(job_id = %job_id, "Progress event for unregistered job ignored");
                    return;
                }
            };
            if entry.status.is_terminal() {
                trace!(job_id = %job_id, "Progress event after terminal status ignored");
                return;
            }
            apply(&mut entry, &kind);
        }

        let event = ProgressEvent {
            job_id: job_id.clone(),
            at: Utc::now(),
            kind,
        };
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events_tx.subscribe()
    }

    pub fn get(&self, job_id: &JobId) -> Option<JobProgress> {
        self.jobs.get(job_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let jobs: BTreeMap<JobId, JobProgress> = self
            .jobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut counts = StatusCounts::default();
        for progress in jobs.values() {
            match progress.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Skipped(_) => counts.skipped += 1,
            }
        }

        let overall_percent = if jobs.is_empty() {
            0.0
        } else {
            jobs.values().map(|p| p.percent).sum::<f64>() / jobs.len() as f64
        };

        ProgressSnapshot {
            jobs,
            overall_percent,
            counts,
            taken_at: Utc::now(),
        }
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn apply(progress: &mut JobProgress, kind: &ProgressEventKind) {
    progress.updated_at = Utc::now();
    match kind {
        ProgressEventKind::Queued { .. } => {
            progress.message = Some("Queued".to_string());
        }
        ProgressEventKind::CacheHit { output_dir } => {
            progress.percent = 100.0;
            progress.message = Some(format!("Skipped (exists at {})", output_dir.display()));
        }
        ProgressEventKind::WaitingForSlot => {
            progress.message = Some("Waiting for a free slot".to_string());
        }
        ProgressEventKind::StageStarted { stage, attempt } => {
            progress.status = JobStatus::Running;
            if *stage != progress.stage {
                progress.percent = 0.0;
            }
            progress.stage = *stage;
            progress.attempt = *attempt;
            progress.message = Some(stage_label(*stage).to_string());
        }
        ProgressEventKind::StageProgress {
            stage,
            percent,
            message,
        } => {
            progress.stage = (*stage).max(progress.stage);
            if let Some(percent) = percent {
                progress.percent = percent.clamp(0.0, 100.0);
            }
            if let Some(message) = message {
                progress.message = Some(message.clone());
            }
        }
        ProgressEventKind::Retrying {
            attempt,
            backoff_ms,
            error,
            ..
        } => {
            progress.attempt = *attempt;
            progress.error = Some(error.clone());
            progress.message = Some(format!("Retrying in {} ms", backoff_ms));
        }
        ProgressEventKind::UploadStarted { total } => {
            progress.status = JobStatus::Running;
            progress.uploads_total = *total;
            progress.uploads_done = 0;
            progress.uploads_failed = 0;
            progress.message = Some(format!("Uploading {} file(s)", total));
        }
        ProgressEventKind::UploadProgress {
            done,
            failed,
            total,
            ..
        } => {
            progress.uploads_done = *done;
            progress.uploads_failed = *failed;
            progress.uploads_total = *total;
        }
        ProgressEventKind::Finished {
            status,
            stage,
            failure_phase,
            error_kind,
            error,
        } => {
            progress.status = *status;
            progress.stage = *stage;
            progress.failure_phase = *failure_phase;
            progress.error_kind = *error_kind;
            progress.error = error.clone();
            progress.percent = match (status, failure_phase) {
                (JobStatus::Failed, Some(FailurePhase::Conversion)) => 0.0,
                _ => 100.0,
            };
            progress.message = Some(match status {
                JobStatus::Succeeded if progress.uploads_total > 0 => {
                    format!("Uploaded ({} files)", progress.uploads_done)
                }
                JobStatus::Succeeded => "Conversion complete".to_string(),
                JobStatus::Skipped(_) => "Skipped (exists)".to_string(),
                JobStatus::Failed => match failure_phase {
                    Some(FailurePhase::Upload) => "Upload failed".to_string(),
                    _ => "Conversion failed".to_string(),
                },
                JobStatus::Pending | JobStatus::Running => status.as_str().to_string(),
            });
        }
    }
}

fn stage_label(stage: JobStage) -> &'static str {
    match stage {
        JobStage::Queued => "Queued",
        JobStage::Hashing => "Hashing",
        JobStage::HealthCheck => "Health check",
        JobStage::Encrypting => "Encrypting",
        JobStage::UploadingToService => "Uploading to service",
        JobStage::RemoteProcessing => "Processing remotely",
        JobStage::FetchingOutputs => "Downloading outputs",
        JobStage::Completed => "Conversion complete",
    }
}
