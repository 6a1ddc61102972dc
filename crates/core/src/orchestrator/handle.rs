//! Caller-side handle to a run in progress.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::types::{OrchestratorError, RunId, RunReport, RunSummary};
use crate::gate::ConcurrencyGate;
use crate::job::ProcessingMode;
use crate::progress::{ProgressAggregator, ProgressEvent, ProgressSnapshot};

/// Limits above this still apply but are logged as unusual.
pub const RECOMMENDED_MAX_CONCURRENCY: usize = 16;

/// Handle to one run: progress, live concurrency changes, cancellation and
/// the final report. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunHandle {
    inner: Arc<RunShared>,
}

#[derive(Debug)]
struct RunShared {
    run_id: RunId,
    mode: ProcessingMode,
    started_at: DateTime<Utc>,
    gate: Arc<ConcurrencyGate>,
    progress: Arc<ProgressAggregator>,
    cancel: CancellationToken,
    report: watch::Receiver<Option<Arc<RunReport>>>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: RunId,
        mode: ProcessingMode,
        started_at: DateTime<Utc>,
        gate: Arc<ConcurrencyGate>,
        progress: Arc<ProgressAggregator>,
        cancel: CancellationToken,
        report: watch::Receiver<Option<Arc<RunReport>>>,
    ) -> Self {
        Self {
            inner: Arc::new(RunShared {
                run_id,
                mode,
                started_at,
                gate,
                progress,
                cancel,
                report,
            }),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    pub fn mode(&self) -> ProcessingMode {
        self.inner.mode
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Cancels every job that has not finished. Jobs fail with a `Cancelled`
    /// error and give back their gate slots.
    pub fn cancel(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(run_id = %self.inner.run_id, "Run cancellation requested");
            self.inner.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Changes the concurrency limit. Jobs already holding a slot keep it.
    pub fn set_concurrency(&self, limit: usize) -> Result<usize, OrchestratorError> {
        if limit == 0 {
            return Err(OrchestratorError::InvalidConcurrency(limit));
        }
        if limit > RECOMMENDED_MAX_CONCURRENCY {
            warn!(
                run_id = %self.inner.run_id,
                limit,
                "Concurrency above {} may exhaust disk space or hit service limits",
                RECOMMENDED_MAX_CONCURRENCY
            );
        }
        Ok(self.inner.gate.resize(limit))
    }

    pub fn concurrency_limit(&self) -> usize {
        self.inner.gate.limit()
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.inner.gate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.progress.snapshot()
    }

    /// The final report, once every job has finished.
    pub fn report(&self) -> Option<Arc<RunReport>> {
        self.inner.report.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.report.borrow().is_some()
    }

    /// Waits for every job to finish and returns the report.
    ///
    /// Returns `None` only if the run's supervisor was torn down, e.g. by
    /// runtime shutdown.
    pub async fn wait(&self) -> Option<Arc<RunReport>> {
        let mut rx = self.inner.report.clone();
        let report = rx.wait_for(Option::is_some).await.ok()?;
        report.clone()
    }

    pub fn summary(&self) -> RunSummary {
        let snapshot = self.snapshot();
        RunSummary {
            run_id: self.inner.run_id.clone(),
            mode: self.inner.mode,
            concurrency_limit: self.concurrency_limit(),
            counts: snapshot.counts,
            overall_percent: snapshot.overall_percent,
            finished: self.is_finished(),
            started_at: self.inner.started_at,
        }
    }
}
