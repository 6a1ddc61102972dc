//! Per-job execution: preflight checks and the conversion stage machine.

mod config;
mod preflight;
mod stage_executor;

pub use config::StageTimeouts;
pub use preflight::{available_space_for, validate_input, Preflight};
pub use stage_executor::StageExecutor;
pub(crate) use stage_executor::run_with_deadline;
