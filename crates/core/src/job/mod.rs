//! Job records: one per input file, tracked from queueing to a terminal status.

mod error;
mod types;

pub use error::{ErrorKind, JobError};
pub use types::{
    FailurePhase, Job, JobId, JobStage, JobStatus, ProcessingMode, SkipReason, UploadStatus,
    UploadTask,
};
