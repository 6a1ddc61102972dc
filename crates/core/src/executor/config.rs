//! Timeouts applied to conversion service calls.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::job::JobStage;

/// Upper bound for each collaborator call, in seconds.
///
/// `remote_processing_secs` bounds the whole polling wait; each individual
/// status request is bounded by `poll_request_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "default_hashing_secs")]
    pub hashing_secs: u64,
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
    #[serde(default = "default_encrypting_secs")]
    pub encrypting_secs: u64,
    #[serde(default = "default_uploading_to_service_secs")]
    pub uploading_to_service_secs: u64,
    #[serde(default = "default_remote_processing_secs")]
    pub remote_processing_secs: u64,
    #[serde(default = "default_poll_request_secs")]
    pub poll_request_secs: u64,
    #[serde(default = "default_fetching_outputs_secs")]
    pub fetching_outputs_secs: u64,
}

fn default_hashing_secs() -> u64 {
    3_600
}

fn default_health_check_secs() -> u64 {
    1_800
}

fn default_encrypting_secs() -> u64 {
    3_600
}

fn default_uploading_to_service_secs() -> u64 {
    4 * 3_600
}

fn default_remote_processing_secs() -> u64 {
    6 * 3_600
}

fn default_poll_request_secs() -> u64 {
    60
}

fn default_fetching_outputs_secs() -> u64 {
    2 * 3_600
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            hashing_secs: default_hashing_secs(),
            health_check_secs: default_health_check_secs(),
            encrypting_secs: default_encrypting_secs(),
            uploading_to_service_secs: default_uploading_to_service_secs(),
            remote_processing_secs: default_remote_processing_secs(),
            poll_request_secs: default_poll_request_secs(),
            fetching_outputs_secs: default_fetching_outputs_secs(),
        }
    }
}

impl StageTimeouts {
    /// Same timeout for every stage.
    pub fn uniform(secs: u64) -> Self {
        Self {
            hashing_secs: secs,
            health_check_secs: secs,
            encrypting_secs: secs,
            uploading_to_service_secs: secs,
            remote_processing_secs: secs,
            poll_request_secs: secs,
            fetching_outputs_secs: secs,
        }
    }

    pub fn for_stage(&self, stage: JobStage) -> Duration {
        let secs = match stage {
            JobStage::Hashing => self.hashing_secs,
            JobStage::HealthCheck => self.health_check_secs,
            JobStage::Encrypting => self.encrypting_secs,
            JobStage::UploadingToService => self.uploading_to_service_secs,
            JobStage::RemoteProcessing => self.remote_processing_secs,
            JobStage::FetchingOutputs => self.fetching_outputs_secs,
            JobStage::Queued | JobStage::Completed => 0,
        };
        Duration::from_secs(secs)
    }

    pub fn poll_request(&self) -> Duration {
        Duration::from_secs(self.poll_request_secs)
    }

    /// Every timeout in the set, for validation.
    pub fn all(&self) -> [(&'static str, u64); 7] {
        [
            ("hashing_secs", self.hashing_secs),
            ("health_check_secs", self.health_check_secs),
            ("encrypting_secs", self.encrypting_secs),
            ("uploading_to_service_secs", self.uploading_to_service_secs),
            ("remote_processing_secs", self.remote_processing_secs),
            ("poll_request_secs", self.poll_request_secs),
            ("fetching_outputs_secs", self.fetching_outputs_secs),
        ]
    }
}
