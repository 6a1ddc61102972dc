//! Configuration for the object store.

use serde::{Deserialize, Serialize};

/// Object store connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base URL of a GCS-compatible JSON API.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Target bucket. Empty means storage is not configured.
    #[serde(default)]
    pub bucket: String,

    /// Bearer token sent with every request.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Prefix prepended to every object key.
    #[serde(default)]
    pub folder_prefix: String,

    /// Timeout for a single request, including the upload body.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            bucket: String::new(),
            access_token: None,
            folder_prefix: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl StorageConfig {
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_folder_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.folder_prefix = prefix.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.bucket.trim().is_empty()
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("folder_prefix", &self.folder_prefix)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}
