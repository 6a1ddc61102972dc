//! Trait definitions for the converter module.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::ConversionError;
use super::types::{ConversionRequest, FetchedOutputs, RemoteStatus, StageProgress};
use crate::job::JobStage;

/// The external service that turns a recording into processed outputs.
///
/// The executor drives one job through the stages in order: `run_stage` for
/// the local and upload stages, `poll_status` while the service processes
/// remotely, then `fetch_outputs`. Every call is wrapped in a timeout by the
/// caller.
#[async_trait]
pub trait ConversionService: Send + Sync {
    /// Returns the name of this service implementation.
    fn name(&self) -> &str;

    /// Checks the service is usable (CLI installed, credentials present).
    async fn validate(&self) -> Result<(), ConversionError>;

    /// Runs one of `Hashing`, `HealthCheck`, `Encrypting` or
    /// `UploadingToService` to completion, reporting progress on `progress_tx`.
    ///
    /// If the receiver is dropped the stage keeps running without reports.
    async fn run_stage(
        &self,
        request: &ConversionRequest,
        stage: JobStage,
        progress_tx: mpsc::Sender<StageProgress>,
    ) -> Result<(), ConversionError>;

    /// One non-blocking status check of the remote processing step.
    async fn poll_status(&self, request: &ConversionRequest)
        -> Result<RemoteStatus, ConversionError>;

    /// Downloads or moves the finished outputs into `request.output_dir`.
    async fn fetch_outputs(
        &self,
        request: &ConversionRequest,
        progress_tx: mpsc::Sender<StageProgress>,
    ) -> Result<FetchedOutputs, ConversionError>;

    /// Drops any per-job state, stopping work still running for the job.
    ///
    /// Called before a failed stage is retried and once the job leaves the
    /// conversion phase.
    async fn release(&self, _request: &ConversionRequest) {}
}
