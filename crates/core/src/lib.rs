pub mod cache;
pub mod config;
pub mod converter;
pub mod executor;
pub mod gate;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod storage;
pub mod testing;
pub mod upload;

pub use cache::{output_dir_for, CacheProbe, CacheResult, OutputLayout};
pub use config::{
    load_config, load_config_from_env, load_config_from_str, validate_config, Config, ConfigError,
    SanitizedConfig,
};
pub use converter::{AriaCliService, AriaConfig, ConversionError, ConversionService};
pub use executor::{Preflight, StageExecutor, StageTimeouts};
pub use gate::{ConcurrencyGate, GatePermit};
pub use job::{
    ErrorKind, FailurePhase, Job, JobError, JobId, JobStage, JobStatus, ProcessingMode,
    UploadStatus, UploadTask,
};
pub use orchestrator::{
    JobOrchestrator, JobReport, OrchestratorConfig, OrchestratorError, RunHandle, RunId,
    RunReport, RunRequest, RunSummary,
};
pub use progress::{JobProgress, ProgressAggregator, ProgressEvent, ProgressEventKind, ProgressSnapshot};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use storage::{HttpObjectStore, ObjectStore, StorageConfig, StorageError};
pub use upload::{UploadDispatcher, UploadReport};
