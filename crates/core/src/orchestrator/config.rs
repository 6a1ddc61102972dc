//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::executor::StageTimeouts;
use crate::retry::RetryConfig;

/// Configuration for the job orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Jobs allowed in an active stage at once, unless a run overrides it.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Output files of one job uploaded in parallel.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    /// Wait between remote status polls (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How often a run logs the state of all its jobs (milliseconds).
    #[serde(default = "default_status_log_interval")]
    pub status_log_interval_ms: u64,

    /// Write outputs under this directory instead of next to each input.
    #[serde(default)]
    pub output_root: Option<PathBuf>,

    /// Free space required next to the output, as a multiple of the input
    /// size. Zero disables the check.
    #[serde(default = "default_disk_space_multiplier")]
    pub disk_space_multiplier: f64,

    /// Progress events kept for slow subscribers.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub timeouts: StageTimeouts,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_concurrency() -> usize {
    2
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_status_log_interval() -> u64 {
    5_000 // 5 seconds
}

fn default_disk_space_multiplier() -> f64 {
    1.5
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            upload_concurrency: default_upload_concurrency(),
            poll_interval_ms: default_poll_interval(),
            status_log_interval_ms: default_status_log_interval(),
            output_root: None,
            disk_space_multiplier: default_disk_space_multiplier(),
            event_buffer: default_event_buffer(),
            timeouts: StageTimeouts::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.default_concurrency = limit;
        self
    }

    pub fn with_upload_concurrency(mut self, limit: usize) -> Self {
        self.upload_concurrency = limit;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = Some(root.into());
        self
    }

    pub fn with_disk_space_multiplier(mut self, multiplier: f64) -> Self {
        self.disk_space_multiplier = multiplier;
        self
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}
