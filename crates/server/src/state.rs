use dashmap::DashMap;
use mps_relay_core::{
    Config, ConversionService, JobOrchestrator, OrchestratorError, RunHandle, RunId, RunRequest,
    RunSummary, SanitizedConfig,
};
use std::sync::Arc;

/// Orchestrator over whichever conversion service the binary wires in.
pub type Orchestrator = JobOrchestrator<dyn ConversionService>;

/// Shared application state
pub struct AppState {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    runs: DashMap<RunId, RunHandle>,
}

impl AppState {
    pub fn new(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
            runs: DashMap::new(),
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        self.orchestrator.as_ref()
    }

    /// Starts a run and keeps its handle for later lookups.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunHandle, OrchestratorError> {
        let handle = self.orchestrator.run(request).await?;
        self.runs.insert(handle.run_id().clone(), handle.clone());
        Ok(handle)
    }

    pub fn run(&self, run_id: &RunId) -> Option<RunHandle> {
        self.runs.get(run_id).map(|entry| entry.value().clone())
    }

    /// Summaries of every known run, oldest first.
    pub fn run_summaries(&self) -> Vec<RunSummary> {
        let mut summaries: Vec<RunSummary> =
            self.runs.iter().map(|entry| entry.value().summary()).collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        summaries
    }

    /// Cancels every run that has not finished.
    pub fn cancel_all(&self) {
        for entry in self.runs.iter() {
            if !entry.value().is_finished() {
                entry.value().cancel();
            }
        }
    }
}
