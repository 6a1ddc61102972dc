//! Job orchestrator implementation.
//!
//! One task per job, supervised by one task per run:
//! - Cache probe and preflight: no gate slot needed
//! - Conversion stages: bounded by the run's concurrency gate
//! - Upload: outside the gate, bounded per job by the dispatcher

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{output_dir_for, CacheProbe, OutputLayout};
use crate::converter::ConversionService;
use crate::executor::{Preflight, StageExecutor};
use crate::gate::ConcurrencyGate;
use crate::job::{FailurePhase, Job, JobError, JobStage, JobStatus, ProcessingMode};
use crate::metrics;
use crate::progress::{ProgressAggregator, ProgressEventKind};
use crate::retry::RetryPolicy;
use crate::storage::{ObjectStore, StorageConfig};
use crate::upload::{UploadDispatcher, UploadSettings};

use super::config::OrchestratorConfig;
use super::handle::{RunHandle, RECOMMENDED_MAX_CONCURRENCY};
use super::types::{JobReport, OrchestratorError, RunId, RunReport, RunRequest};

/// Object store plus the settings the dispatcher needs from its config.
#[derive(Clone)]
struct StorageTarget {
    store: Arc<dyn ObjectStore>,
    folder_prefix: Option<String>,
    request_timeout: Duration,
}

/// Creates jobs for a batch of inputs and drives each to a terminal status.
pub struct JobOrchestrator<C>
where
    C: ConversionService + ?Sized + 'static,
{
    config: OrchestratorConfig,
    layout: OutputLayout,
    converter: Arc<C>,
    storage: Option<StorageTarget>,
}

impl<C> JobOrchestrator<C>
where
    C: ConversionService + ?Sized + 'static,
{
    pub fn new(config: OrchestratorConfig, layout: OutputLayout, converter: Arc<C>) -> Self {
        Self {
            config,
            layout,
            converter,
            storage: None,
        }
    }

    /// Sets the object store used by modes that upload.
    pub fn with_storage(mut self, store: Arc<dyn ObjectStore>, config: &StorageConfig) -> Self {
        self.storage = Some(StorageTarget {
            store,
            folder_prefix: Some(config.folder_prefix.clone()).filter(|p| !p.is_empty()),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        });
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn converter(&self) -> &Arc<C> {
        &self.converter
    }

    /// Starts a run and returns immediately.
    ///
    /// Rejects the request before creating any job when it has no inputs,
    /// a zero concurrency limit, or uploads to an unreachable bucket.
    pub async fn run(&self, request: RunRequest) -> Result<RunHandle, OrchestratorError> {
        if request.inputs.is_empty() {
            return Err(OrchestratorError::NoInputs);
        }
        let limit = request
            .concurrency_limit
            .unwrap_or(self.config.default_concurrency);
        if limit == 0 {
            return Err(OrchestratorError::InvalidConcurrency(limit));
        }
        if limit > RECOMMENDED_MAX_CONCURRENCY {
            warn!(
                limit,
                "Concurrency above {} may exhaust disk space or hit service limits",
                RECOMMENDED_MAX_CONCURRENCY
            );
        }

        let uploader = if request.mode.includes_upload() {
            let target = self
                .storage
                .as_ref()
                .ok_or(OrchestratorError::StorageNotConfigured)?;
            target.store.verify().await.map_err(|e| {
                error!(store = target.store.name(), "Storage check failed: {}", e);
                OrchestratorError::StorageUnavailable(e.to_string())
            })?;
            Some(target)
        } else {
            None
        };

        let run_id = RunId::new();
        let started_at = Utc::now();
        let output_root = request
            .output_root
            .clone()
            .or_else(|| self.config.output_root.clone());
        let jobs = build_jobs(&request.inputs, output_root.as_deref());

        let progress = Arc::new(ProgressAggregator::new(self.config.event_buffer));
        for job in &jobs {
            progress.register(&job.id, job.input_path.clone());
        }
        let gate = ConcurrencyGate::new(limit);
        let cancel = CancellationToken::new();
        let retry = RetryPolicy::new(self.config.retry.clone());
        let probe = CacheProbe::new(self.layout.clone());

        let uploader = uploader.map(|target| {
            UploadDispatcher::new(
                Arc::clone(&target.store),
                retry.clone(),
                UploadSettings {
                    concurrency: self.config.upload_concurrency,
                    request_timeout: target.request_timeout,
                    folder_prefix: request
                        .folder_prefix
                        .clone()
                        .or_else(|| target.folder_prefix.clone()),
                },
                Arc::clone(&progress),
            )
        });

        let ctx = Arc::new(RunContext {
            mode: request.mode,
            executor: StageExecutor::new(
                Arc::clone(&self.converter),
                probe.clone(),
                retry,
                self.config.timeouts.clone(),
                Duration::from_millis(self.config.poll_interval_ms),
                Arc::clone(&progress),
            ),
            probe,
            preflight: Preflight::new(self.config.disk_space_multiplier),
            uploader,
            gate: Arc::clone(&gate),
            progress: Arc::clone(&progress),
            cancel: cancel.clone(),
        });

        info!(
            run_id = %run_id,
            mode = %request.mode,
            jobs = jobs.len(),
            concurrency = limit,
            "Starting run"
        );

        let (report_tx, report_rx) = watch::channel(None);
        let handle = RunHandle::new(
            run_id.clone(),
            request.mode,
            started_at,
            gate,
            progress,
            cancel,
            report_rx,
        );

        let status_interval = Duration::from_millis(self.config.status_log_interval_ms.max(1));
        tokio::spawn(supervise(ctx, jobs, run_id, started_at, status_interval, report_tx));

        Ok(handle)
    }
}

/// Everything a job task shares with its siblings.
struct RunContext<C: ConversionService + ?Sized> {
    mode: ProcessingMode,
    executor: StageExecutor<C>,
    probe: CacheProbe,
    preflight: Preflight,
    uploader: Option<UploadDispatcher>,
    gate: Arc<ConcurrencyGate>,
    progress: Arc<ProgressAggregator>,
    cancel: CancellationToken,
}

/// One job per distinct resolved input path, in input order.
fn build_jobs(inputs: &[PathBuf], output_root: Option<&Path>) -> Vec<Job> {
    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let resolved = resolve(input);
        if !seen.insert(resolved.clone()) {
            debug!(path = %input.display(), "Duplicate input ignored");
            continue;
        }
        let output_dir = output_dir_for(&resolved, output_root);
        jobs.push(Job::new(resolved, output_dir));
    }
    jobs
}

fn resolve(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Runs every job of a run and publishes the report once all are terminal.
async fn supervise<C: ConversionService + ?Sized + 'static>(
    ctx: Arc<RunContext<C>>,
    jobs: Vec<Job>,
    run_id: RunId,
    started_at: DateTime<Utc>,
    status_interval: Duration,
    report_tx: watch::Sender<Option<Arc<RunReport>>>,
) {
    let mut set = JoinSet::new();
    // Unstarted copies, used to report a job whose task panicked.
    let mut in_flight = HashMap::new();
    for job in jobs {
        let skeleton = job.clone();
        let handle = set.spawn(process_job(Arc::clone(&ctx), job));
        in_flight.insert(handle.id(), skeleton);
    }

    let mut finished = Vec::with_capacity(in_flight.len());
    let mut ticker = tokio::time::interval(status_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            joined = set.join_next_with_id() => match joined {
                None => break,
                Some(Ok((id, job))) => {
                    in_flight.remove(&id);
                    finished.push(job);
                }
                Some(Err(e)) => {
                    let Some(mut job) = in_flight.remove(&e.id()) else {
                        error!(run_id = %run_id, "Unknown job task failed: {}", e);
                        continue;
                    };
                    error!(run_id = %run_id, job_id = %job.id, "Job task failed: {}", e);
                    job.fail(JobError::internal(format!("job task failed: {}", e)), FailurePhase::Conversion);
                    finish(&ctx, &job);
                    finished.push(job);
                }
            },
            _ = ticker.tick() => log_status(&run_id, &ctx.progress, &ctx.gate),
        }
    }

    let jobs = finished.iter().map(JobReport::from).collect();
    let report = RunReport::new(run_id.clone(), ctx.mode, jobs, started_at);
    info!(
        run_id = %run_id,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        conversion_failures = report.conversion_failures,
        upload_failures = report.upload_failures,
        peak_concurrency = ctx.gate.peak(),
        "Run finished"
    );
    let _ = report_tx.send(Some(Arc::new(report)));
}

fn log_status(run_id: &RunId, progress: &ProgressAggregator, gate: &ConcurrencyGate) {
    let snapshot = progress.snapshot();
    info!(
        run_id = %run_id,
        overall_percent = %format!("{:.2}", snapshot.overall_percent),
        pending = snapshot.counts.pending,
        running = snapshot.counts.running,
        succeeded = snapshot.counts.succeeded,
        failed = snapshot.counts.failed,
        skipped = snapshot.counts.skipped,
        slots = %format!("{}/{}", gate.in_use(), gate.limit()),
        "Run status"
    );
    for job in snapshot.jobs.values() {
        debug!(run_id = %run_id, "{}", job.status_line());
    }
}

/// Drives one job to a terminal status.
async fn process_job<C: ConversionService + ?Sized>(ctx: Arc<RunContext<C>>, mut job: Job) -> Job {
    let outcome = match ctx.mode {
        ProcessingMode::UploadOnly => upload_existing(&ctx, &mut job).await,
        ProcessingMode::ConvertOnly | ProcessingMode::ConvertAndUpload => {
            convert_then_upload(&ctx, &mut job).await
        }
    };

    match outcome {
        Ok(Outcome::Succeeded) => job.succeed(),
        Ok(Outcome::CacheHit) => job.skip_cache_hit(),
        Err((error, phase)) => job.fail(error, phase),
    }
    finish(&ctx, &job);
    job
}

enum Outcome {
    Succeeded,
    CacheHit,
}

type JobResult = Result<Outcome, (JobError, FailurePhase)>;

async fn convert_then_upload<C: ConversionService + ?Sized>(
    ctx: &RunContext<C>,
    job: &mut Job,
) -> JobResult {
    let conversion = |e| (e, FailurePhase::Conversion);

    if ctx.cancel.is_cancelled() {
        return Err(conversion(JobError::Cancelled { stage: job.stage }));
    }

    let cache = ctx.probe.probe(job);
    if let Some(e) = &cache.error {
        warn!(job_id = %job.id, "{}; treating as cache miss", e);
    }

    if cache.hit {
        info!(job_id = %job.id, output_dir = %job.output_dir.display(), "Output exists, skipping conversion");
        ctx.progress.record(
            &job.id,
            ProgressEventKind::CacheHit {
                output_dir: job.output_dir.clone(),
            },
        );
        if ctx.mode.includes_upload() {
            upload(ctx, job).await?;
        }
        return Ok(Outcome::CacheHit);
    }

    ctx.preflight.check(job).map_err(conversion)?;

    ctx.progress
        .record(&job.id, ProgressEventKind::WaitingForSlot);
    let permit = ctx
        .gate
        .acquire(&ctx.cancel)
        .await
        .map_err(|_| conversion(JobError::Cancelled { stage: job.stage }))?;
    debug!(job_id = %job.id, in_use = ctx.gate.in_use(), limit = ctx.gate.limit(), "Admitted");

    job.mark_running();
    let result = ctx.executor.execute(job, &ctx.cancel).await;
    permit.release();
    result.map_err(conversion)?;

    if ctx.mode.includes_upload() {
        upload(ctx, job).await?;
    }
    Ok(Outcome::Succeeded)
}

async fn upload_existing<C: ConversionService + ?Sized>(
    ctx: &RunContext<C>,
    job: &mut Job,
) -> JobResult {
    if ctx.cancel.is_cancelled() {
        return Err((JobError::Cancelled { stage: job.stage }, FailurePhase::Upload));
    }
    let cache = ctx.probe.probe(job);
    if !cache.hit {
        let reason = if cache.missing.iter().any(|p| p == &job.output_dir) {
            "output directory does not exist".to_string()
        } else {
            let missing: Vec<String> = cache
                .missing
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            format!("output is incomplete, missing: {}", missing.join(", "))
        };
        return Err((JobError::validation(&job.output_dir, reason), FailurePhase::Upload));
    }

    job.mark_running();
    job.enter_stage(JobStage::Completed);
    upload(ctx, job).await?;
    Ok(Outcome::Succeeded)
}

async fn upload<C: ConversionService + ?Sized>(
    ctx: &RunContext<C>,
    job: &mut Job,
) -> Result<(), (JobError, FailurePhase)> {
    let Some(uploader) = &ctx.uploader else {
        return Err((
            JobError::internal("upload requested without object storage"),
            FailurePhase::Upload,
        ));
    };
    job.mark_running();
    uploader
        .dispatch(job, &ctx.cancel)
        .await
        .map(|_| ())
        .map_err(|e| (e, FailurePhase::Upload))
}

/// Logs, counts and publishes a job's terminal status.
fn finish<C: ConversionService + ?Sized>(ctx: &RunContext<C>, job: &Job) {
    metrics::JOBS_FINISHED
        .with_label_values(&[job.status.as_str()])
        .inc();

    match job.status {
        JobStatus::Failed => warn!(
            job_id = %job.id,
            stage = %job.stage,
            "Job failed: {}",
            job.error_summary().unwrap_or_default()
        ),
        status => info!(job_id = %job.id, status = %status, duration_ms = job.duration_ms().unwrap_or(0), "Job finished"),
    }

    let failed = job.status == JobStatus::Failed;
    ctx.progress.record(
        &job.id,
        ProgressEventKind::Finished {
            status: job.status,
            stage: job.stage,
            failure_phase: job.failure_phase,
            error_kind: job.last_error.as_ref().filter(|_| failed).map(|e| e.kind()),
            error: job.error_summary(),
        },
    );
}
