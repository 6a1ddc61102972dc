//! Retry policy: whether to re-attempt a stage, and after how long.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::job::{Job, JobError};

/// Retry settings shared by conversion stages and per-file uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt. The total attempt ceiling is
    /// `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    120_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Config without delays, for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Errors the policy can classify.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for JobError {
    fn is_retryable(&self) -> bool {
        JobError::is_retryable(self)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub backoff: Duration,
}

impl RetryDecision {
    pub const GIVE_UP: RetryDecision = RetryDecision {
        retry: false,
        backoff: Duration::ZERO,
    };
}

/// Exponential backoff capped at `max_delay_ms`, retrying transient errors only.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decides for a job whose current stage has just failed with `error`.
    /// `job.attempt` must already count this failure.
    pub fn should_retry(&self, job: &Job, error: &JobError) -> RetryDecision {
        self.decide(job.attempt, error)
    }

    /// Decides after the `attempts`-th failed attempt (1-based) of any operation.
    pub fn decide<E: Retryable + ?Sized>(&self, attempts: u32, error: &E) -> RetryDecision {
        if !error.is_retryable() || attempts > self.config.max_retries {
            return RetryDecision::GIVE_UP;
        }
        RetryDecision {
            retry: true,
            backoff: self.backoff_for(attempts),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStage;
    use std::path::PathBuf;

    fn transient() -> JobError {
        JobError::TransientService {
            stage: JobStage::UploadingToService,
            message: "503".to_string(),
            attempts: 1,
        }
    }

    #[test]
    fn test_transient_retried_up_to_ceiling() {
        let policy = RetryPolicy::default();
        assert!(policy.decide(1, &transient()).retry);
        assert!(policy.decide(3, &transient()).retry);
        assert!(!policy.decide(4, &transient()).retry);
        assert_eq!(policy.config().max_attempts(), 4);
    }

    #[test]
    fn test_should_retry_reads_job_attempt() {
        let policy = RetryPolicy::new(RetryConfig::immediate(1));
        let mut job = Job::new(PathBuf::from("/d/a.vrs"), PathBuf::from("/d/mps_a_vrs"));
        job.enter_stage(JobStage::Hashing);

        job.record_attempt_failure(transient());
        assert!(policy.should_retry(&job, &transient()).retry);

        job.record_attempt_failure(transient());
        assert!(!policy.should_retry(&job, &transient()).retry);
    }

    #[test]
    fn test_structural_errors_never_retried() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(1, &JobError::validation("/a.vrs", "empty"));
        assert_eq!(decision, RetryDecision::GIVE_UP);

        let decision = policy.decide(
            1,
            &JobError::PermanentService {
                stage: JobStage::RemoteProcessing,
                message: "rejected".to_string(),
            },
        );
        assert!(!decision.retry);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        });
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_config_defaults_from_toml() {
        let config: RetryConfig = toml::from_str("max_retries = 5").unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_delay_ms, 5_000);
        assert_eq!(config.backoff_multiplier, 2.0);
    }
}
