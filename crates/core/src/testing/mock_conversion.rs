//! Mock conversion service for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use super::fixtures::write_complete_output;
use crate::cache::OutputLayout;
use crate::converter::{
    ConversionError, ConversionRequest, ConversionService, FetchedOutputs, RemoteStatus,
    StageProgress,
};
use crate::job::{JobId, JobStage};

/// One call made to the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Validate,
    RunStage(JobStage),
    Poll,
    Fetch,
    Release,
}

/// A recorded call for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub job_id: Option<JobId>,
    pub call: MockCall,
}

/// Mock implementation of the ConversionService trait.
///
/// Provides controllable behavior for testing:
/// - Record every call per job
/// - Queue failures per stage (`RemoteProcessing` fails polls,
///   `FetchingOutputs` fails fetches)
/// - Control stage delays and how long remote processing lasts
/// - Write a complete output set on fetch
///
/// # Example
///
/// ```rust,ignore
/// use mps_relay_core::testing::MockConversionService;
///
/// let service = MockConversionService::new();
/// service
///     .fail_stage(JobStage::UploadingToService, vec![ConversionError::network("reset")])
///     .await;
/// ```
#[derive(Debug, Clone)]
pub struct MockConversionService {
    calls: Arc<RwLock<Vec<RecordedCall>>>,
    failures: Arc<RwLock<HashMap<JobStage, VecDeque<ConversionError>>>>,
    delays: Arc<RwLock<HashMap<JobStage, Duration>>>,
    default_delay: Arc<RwLock<Duration>>,
    processing_polls: Arc<RwLock<u32>>,
    polls_seen: Arc<RwLock<HashMap<JobId, u32>>>,
    write_outputs: Arc<RwLock<bool>>,
    layout: Arc<RwLock<OutputLayout>>,
    validate_error: Arc<RwLock<Option<ConversionError>>>,
}

impl Default for MockConversionService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConversionService {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(RwLock::new(HashMap::new())),
            delays: Arc::new(RwLock::new(HashMap::new())),
            default_delay: Arc::new(RwLock::new(Duration::from_millis(5))),
            processing_polls: Arc::new(RwLock::new(1)),
            polls_seen: Arc::new(RwLock::new(HashMap::new())),
            write_outputs: Arc::new(RwLock::new(true)),
            layout: Arc::new(RwLock::new(OutputLayout::default())),
            validate_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Queues errors returned by the next calls for `stage`, in order, by
    /// whichever job gets there first.
    pub async fn fail_stage(&self, stage: JobStage, errors: Vec<ConversionError>) {
        self.failures
            .write()
            .await
            .entry(stage)
            .or_default()
            .extend(errors);
    }

    pub async fn set_stage_delay(&self, stage: JobStage, delay: Duration) {
        self.delays.write().await.insert(stage, delay);
    }

    /// Delay for every stage without its own delay.
    pub async fn set_default_delay(&self, delay: Duration) {
        *self.default_delay.write().await = delay;
    }

    /// Polls answered with `Processing` before a job's outputs are ready.
    /// `u32::MAX` keeps every job processing forever.
    pub async fn set_processing_polls(&self, polls: u32) {
        *self.processing_polls.write().await = polls;
    }

    /// Whether `fetch_outputs` writes a complete output set.
    pub async fn set_write_outputs(&self, write: bool) {
        *self.write_outputs.write().await = write;
    }

    pub async fn set_layout(&self, layout: OutputLayout) {
        *self.layout.write().await = layout;
    }

    pub async fn set_validate_error(&self, error: ConversionError) {
        *self.validate_error.write().await = Some(error);
    }

    /// Get all recorded calls.
    pub async fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.read().await.clone()
    }

    /// Calls made for `job_id`, in order.
    pub async fn calls_for(&self, job_id: &JobId) -> Vec<MockCall> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.job_id.as_ref() == Some(job_id))
            .map(|c| c.call.clone())
            .collect()
    }

    /// Calls doing conversion work (everything but `validate` and `release`).
    pub async fn work_call_count(&self) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| !matches!(c.call, MockCall::Validate | MockCall::Release))
            .count()
    }

    /// Stages passed to `run_stage` for `job_id`, retries included.
    pub async fn stages_run(&self, job_id: &JobId) -> Vec<JobStage> {
        self.calls_for(job_id)
            .await
            .into_iter()
            .filter_map(|c| match c {
                MockCall::RunStage(stage) => Some(stage),
                _ => None,
            })
            .collect()
    }

    /// How many times `stage` was attempted for `job_id`.
    pub async fn stage_attempts(&self, job_id: &JobId, stage: JobStage) -> usize {
        self.calls_for(job_id)
            .await
            .into_iter()
            .filter(|c| match (c, stage) {
                (MockCall::RunStage(s), _) => *s == stage,
                (MockCall::Poll, JobStage::RemoteProcessing) => true,
                (MockCall::Fetch, JobStage::FetchingOutputs) => true,
                _ => false,
            })
            .count()
    }

    pub async fn release_count(&self, job_id: &JobId) -> usize {
        self.calls_for(job_id)
            .await
            .into_iter()
            .filter(|c| *c == MockCall::Release)
            .count()
    }

    async fn record(&self, job_id: Option<&JobId>, call: MockCall) {
        self.calls.write().await.push(RecordedCall {
            job_id: job_id.cloned(),
            call,
        });
    }

    async fn next_failure(&self, stage: JobStage) -> Option<ConversionError> {
        self.failures
            .write()
            .await
            .get_mut(&stage)
            .and_then(VecDeque::pop_front)
    }

    async fn delay_for(&self, stage: JobStage) -> Duration {
        match self.delays.read().await.get(&stage) {
            Some(delay) => *delay,
            None => *self.default_delay.read().await,
        }
    }
}

#[async_trait]
impl ConversionService for MockConversionService {
    fn name(&self) -> &str {
        "mock"
    }

    async fn validate(&self) -> Result<(), ConversionError> {
        self.record(None, MockCall::Validate).await;
        match self.validate_error.write().await.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_stage(
        &self,
        request: &ConversionRequest,
        stage: JobStage,
        progress_tx: mpsc::Sender<StageProgress>,
    ) -> Result<(), ConversionError> {
        self.record(Some(&request.job_id), MockCall::RunStage(stage))
            .await;

        let delay = self.delay_for(stage).await;
        let _ = progress_tx
            .send(StageProgress {
                stage,
                percent: Some(50.0),
                message: None,
            })
            .await;
        tokio::time::sleep(delay).await;

        if let Some(e) = self.next_failure(stage).await {
            return Err(e);
        }
        let _ = progress_tx
            .send(StageProgress {
                stage,
                percent: Some(100.0),
                message: None,
            })
            .await;
        Ok(())
    }

    async fn poll_status(
        &self,
        request: &ConversionRequest,
    ) -> Result<RemoteStatus, ConversionError> {
        self.record(Some(&request.job_id), MockCall::Poll).await;
        if let Some(e) = self.next_failure(JobStage::RemoteProcessing).await {
            return Err(e);
        }

        let limit = *self.processing_polls.read().await;
        let mut seen = self.polls_seen.write().await;
        let count = seen.entry(request.job_id.clone()).or_insert(0);
        if *count >= limit {
            return Ok(RemoteStatus::Ready);
        }
        *count += 1;
        Ok(RemoteStatus::Processing {
            percent: None,
            message: Some("Processing".to_string()),
        })
    }

    async fn fetch_outputs(
        &self,
        request: &ConversionRequest,
        progress_tx: mpsc::Sender<StageProgress>,
    ) -> Result<FetchedOutputs, ConversionError> {
        self.record(Some(&request.job_id), MockCall::Fetch).await;
        tokio::time::sleep(self.delay_for(JobStage::FetchingOutputs).await).await;
        if let Some(e) = self.next_failure(JobStage::FetchingOutputs).await {
            return Err(e);
        }

        let mut files = 0;
        if *self.write_outputs.read().await {
            let layout = self.layout.read().await.clone();
            write_complete_output(&request.output_dir, &layout);
            files = layout.all_paths().count();
        }
        let _ = progress_tx
            .send(StageProgress {
                stage: JobStage::FetchingOutputs,
                percent: Some(100.0),
                message: Some("Downloaded".to_string()),
            })
            .await;

        Ok(FetchedOutputs {
            output_dir: request.output_dir.clone(),
            files,
            bytes: 0,
        })
    }

    async fn release(&self, request: &ConversionRequest) {
        self.record(Some(&request.job_id), MockCall::Release).await;
        self.polls_seen.write().await.remove(&request.job_id);
    }
}
