//! Drives one job through the conversion stages.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::StageTimeouts;
use crate::cache::CacheProbe;
use crate::converter::{
    ConversionError, ConversionRequest, ConversionService, RemoteStatus, StageProgress,
};
use crate::job::{Job, JobError, JobId, JobStage};
use crate::metrics;
use crate::progress::{ProgressAggregator, ProgressEventKind};
use crate::retry::RetryPolicy;

/// Runs `Hashing` through `FetchingOutputs` for one job, in order, with
/// per-stage retry, timeouts and cancellation.
///
/// A failed stage is only ever re-entered, never an earlier one. The
/// service's per-job state is released on every exit path.
pub struct StageExecutor<C: ConversionService + ?Sized> {
    service: Arc<C>,
    probe: CacheProbe,
    retry: RetryPolicy,
    timeouts: StageTimeouts,
    poll_interval: Duration,
    progress: Arc<ProgressAggregator>,
}

impl<C: ConversionService + ?Sized> StageExecutor<C> {
    pub fn new(
        service: Arc<C>,
        probe: CacheProbe,
        retry: RetryPolicy,
        timeouts: StageTimeouts,
        poll_interval: Duration,
        progress: Arc<ProgressAggregator>,
    ) -> Self {
        Self {
            service,
            probe,
            retry,
            timeouts,
            poll_interval,
            progress,
        }
    }

    /// Runs every conversion stage. On success the job is in `Completed`;
    /// on failure it stays in the stage that failed.
    pub async fn execute(&self, job: &mut Job, cancel: &CancellationToken) -> Result<(), JobError> {
        let request = ConversionRequest::from(&*job);
        let result = self.run_stages(job, &request, cancel).await;
        self.service.release(&request).await;
        result
    }

    async fn run_stages(
        &self,
        job: &mut Job,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        for stage in JobStage::CONVERSION {
            job.enter_stage(stage);
            self.run_with_retry(job, request, stage, cancel).await?;
        }
        job.enter_stage(JobStage::Completed);
        self.progress.record(
            &job.id,
            ProgressEventKind::StageProgress {
                stage: JobStage::Completed,
                percent: Some(100.0),
                message: Some("Conversion complete".to_string()),
            },
        );
        info!(job_id = %job.id, "Conversion complete");
        Ok(())
    }

    async fn run_with_retry(
        &self,
        job: &mut Job,
        request: &ConversionRequest,
        stage: JobStage,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        loop {
            info!(job_id = %job.id, stage = %stage, attempt = job.attempt + 1, "Stage started");
            self.progress.record(
                &job.id,
                ProgressEventKind::StageStarted {
                    stage,
                    attempt: job.attempt,
                },
            );

            let started = Instant::now();
            let result = self.attempt(&job.id, request, stage, cancel).await;
            metrics::STAGE_DURATION
                .with_label_values(&[stage.as_str()])
                .observe(started.elapsed().as_secs_f64());

            let error = match result {
                Ok(()) => {
                    debug!(job_id = %job.id, stage = %stage, elapsed_ms = started.elapsed().as_millis() as u64, "Stage finished");
                    return Ok(());
                }
                Err(e) => job_error(e, stage, job.attempt + 1),
            };

            if error.is_cancelled() {
                info!(job_id = %job.id, stage = %stage, "Stage cancelled");
                job.last_error = Some(error.clone());
                return Err(error);
            }

            job.record_attempt_failure(error.clone());
            let decision = self.retry.should_retry(job, &error);
            if !decision.retry {
                warn!(job_id = %job.id, stage = %stage, attempts = job.attempt, "Stage failed: {}", error);
                return Err(error);
            }

            metrics::STAGE_RETRIES
                .with_label_values(&[stage.as_str()])
                .inc();
            warn!(
                job_id = %job.id,
                stage = %stage,
                attempt = job.attempt,
                backoff_ms = decision.backoff.as_millis() as u64,
                "Stage failed, retrying: {}",
                error
            );
            self.progress.record(
                &job.id,
                ProgressEventKind::Retrying {
                    stage,
                    attempt: job.attempt,
                    backoff_ms: decision.backoff.as_millis() as u64,
                    error: error.to_string(),
                },
            );

            // A retried stage starts from a fresh service session.
            self.service.release(request).await;

            tokio::select! {
                _ = cancel.cancelled() => {
                    let error = JobError::Cancelled { stage };
                    job.last_error = Some(error.clone());
                    return Err(error);
                }
                _ = tokio::time::sleep(decision.backoff) => {}
            }
        }
    }

    async fn attempt(
        &self,
        job_id: &JobId,
        request: &ConversionRequest,
        stage: JobStage,
        cancel: &CancellationToken,
    ) -> Result<(), ConversionError> {
        match stage {
            JobStage::RemoteProcessing => self.wait_remote(job_id, request, cancel).await,
            JobStage::FetchingOutputs => self.fetch(job_id, request, cancel).await,
            _ => {
                let (tx, rx) = mpsc::channel(64);
                let call = run_with_deadline(
                    self.service.run_stage(request, stage, tx),
                    self.timeouts.for_stage(stage),
                    cancel,
                    stage.as_str(),
                );
                self.with_progress(job_id, rx, call).await
            }
        }
    }

    /// Polls until the service reports outputs ready. Sleeps `poll_interval`
    /// between polls and checks `cancel` while sleeping.
    async fn wait_remote(
        &self,
        job_id: &JobId,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ConversionError> {
        let budget = self.timeouts.for_stage(JobStage::RemoteProcessing);
        let deadline = Instant::now() + budget;

        loop {
            let status = run_with_deadline(
                self.service.poll_status(request),
                self.timeouts.poll_request(),
                cancel,
                "status poll",
            )
            .await?;

            match status {
                RemoteStatus::Ready => return Ok(()),
                RemoteStatus::Processing { percent, message } => {
                    self.progress.record(
                        job_id,
                        ProgressEventKind::StageProgress {
                            stage: JobStage::RemoteProcessing,
                            percent,
                            message,
                        },
                    );
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ConversionError::Timeout {
                    operation: JobStage::RemoteProcessing.as_str().to_string(),
                    timeout_secs: budget.as_secs(),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ConversionError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval.min(deadline - now)) => {}
            }
        }
    }

    /// Fetches outputs, then requires them to pass the cache completeness check.
    async fn fetch(
        &self,
        job_id: &JobId,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ConversionError> {
        let (tx, rx) = mpsc::channel(64);
        let call = run_with_deadline(
            self.service.fetch_outputs(request, tx),
            self.timeouts.for_stage(JobStage::FetchingOutputs),
            cancel,
            JobStage::FetchingOutputs.as_str(),
        );
        let fetched = self.with_progress(job_id, rx, call).await?;
        debug!(job_id = %job_id, files = fetched.files, bytes = fetched.bytes, "Outputs fetched");

        let check = self.probe.probe_dir(&request.output_dir);
        if !check.hit {
            let missing = check
                .missing
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConversionError::OutputIncomplete {
                path: request.output_dir.clone(),
                missing,
            });
        }
        Ok(())
    }

    /// Awaits `call` while forwarding its progress reports to the aggregator.
    async fn with_progress<T>(
        &self,
        job_id: &JobId,
        mut rx: mpsc::Receiver<StageProgress>,
        call: impl Future<Output = Result<T, ConversionError>>,
    ) -> Result<T, ConversionError> {
        tokio::pin!(call);
        let mut open = true;
        loop {
            tokio::select! {
                result = &mut call => {
                    while let Ok(update) = rx.try_recv() {
                        self.forward(job_id, update);
                    }
                    return result;
                }
                update = rx.recv(), if open => match update {
                    Some(update) => self.forward(job_id, update),
                    None => open = false,
                }
            }
        }
    }

    fn forward(&self, job_id: &JobId, update: StageProgress) {
        self.progress.record(
            job_id,
            ProgressEventKind::StageProgress {
                stage: update.stage,
                percent: update.percent,
                message: update.message,
            },
        );
    }
}

/// Bounds a collaborator call by `timeout` and aborts it when `cancel` fires.
pub(crate) async fn run_with_deadline<T, E>(
    call: impl Future<Output = Result<T, E>>,
    timeout: Duration,
    cancel: &CancellationToken,
    operation: &str,
) -> Result<T, E>
where
    E: From<DeadlineError>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(E::from(DeadlineError::Cancelled)),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(result) => result,
            Err(_) => Err(E::from(DeadlineError::TimedOut {
                operation: operation.to_string(),
                timeout,
            })),
        },
    }
}

/// Why `run_with_deadline` gave up on a call.
#[derive(Debug)]
pub(crate) enum DeadlineError {
    Cancelled,
    TimedOut { operation: String, timeout: Duration },
}

impl From<DeadlineError> for ConversionError {
    fn from(e: DeadlineError) -> Self {
        match e {
            DeadlineError::Cancelled => ConversionError::Cancelled,
            DeadlineError::TimedOut { operation, timeout } => ConversionError::Timeout {
                operation,
                timeout_secs: timeout.as_secs(),
            },
        }
    }
}

impl From<DeadlineError> for crate::storage::StorageError {
    fn from(e: DeadlineError) -> Self {
        match e {
            DeadlineError::Cancelled => crate::storage::StorageError::Cancelled,
            DeadlineError::TimedOut { timeout, .. } => crate::storage::StorageError::Timeout {
                timeout_secs: timeout.as_secs(),
            },
        }
    }
}

/// Folds a service error into the job's error model.
fn job_error(error: ConversionError, stage: JobStage, attempts: u32) -> JobError {
    match error {
        ConversionError::Cancelled => JobError::Cancelled { stage },
        ConversionError::InputNotFound { path } => JobError::validation(path, "file not found"),
        e if e.is_retryable() => JobError::TransientService {
            stage,
            message: e.to_string(),
            attempts,
        },
        e => JobError::PermanentService {
            stage,
            message: e.to_string(),
        },
    }
}
