//! Job orchestrator for batch conversion runs.
//!
//! The orchestrator turns a batch of inputs into jobs and drives each one
//! independently:
//! - **Cache probe**: complete outputs skip conversion entirely
//! - **Conversion**: admitted through a resizable concurrency gate
//! - **Upload**: per-file, outside the gate

mod config;
mod handle;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use handle::{RunHandle, RECOMMENDED_MAX_CONCURRENCY};
pub use runner::JobOrchestrator;
pub use types::{JobReport, OrchestratorError, RunId, RunReport, RunRequest, RunSummary};
