//! Progress aggregation for all jobs of a run.
//!
//! The aggregator mirrors job events; it never mutates a `Job`. Callers poll
//! [`ProgressAggregator::snapshot`] or subscribe to the event stream.

mod aggregator;
mod types;

pub use aggregator::ProgressAggregator;
pub use types::{JobProgress, ProgressEvent, ProgressEventKind, ProgressSnapshot, StatusCounts};
