//! Mock object store for testing.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::storage::{ObjectStore, StorageError};

/// A recorded upload for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub local_path: PathBuf,
    pub remote_key: String,
    pub bytes: u64,
}

/// Mock implementation of the ObjectStore trait.
///
/// Keys registered with `fail_key` always fail with a retryable 503;
/// `set_next_error` fails only the next upload.
#[derive(Debug, Clone)]
pub struct MockStorage {
    uploads: Arc<RwLock<Vec<RecordedUpload>>>,
    failing_keys: Arc<RwLock<HashSet<String>>>,
    next_error: Arc<RwLock<Option<StorageError>>>,
    verify_error: Arc<RwLock<Option<String>>>,
    upload_delay: Arc<RwLock<Duration>>,
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStorage {
    pub fn new() -> Self {
        Self {
            uploads: Arc::new(RwLock::new(Vec::new())),
            failing_keys: Arc::new(RwLock::new(HashSet::new())),
            next_error: Arc::new(RwLock::new(None)),
            verify_error: Arc::new(RwLock::new(None)),
            upload_delay: Arc::new(RwLock::new(Duration::ZERO)),
        }
    }

    pub async fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.write().await.insert(key.into());
    }

    /// Configure the next upload to fail with the given error.
    pub async fn set_next_error(&self, error: StorageError) {
        *self.next_error.write().await = Some(error);
    }

    /// Makes `verify` fail as if the bucket did not exist.
    pub async fn set_verify_error(&self, reason: impl Into<String>) {
        *self.verify_error.write().await = Some(reason.into());
    }

    pub async fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.write().await = delay;
    }

    pub async fn recorded_uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.read().await.clone()
    }

    /// Keys uploaded successfully, sorted.
    pub async fn uploaded_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .uploads
            .read()
            .await
            .iter()
            .map(|u| u.remote_key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub async fn upload_count(&self) -> usize {
        self.uploads.read().await.len()
    }
}

#[async_trait]
impl ObjectStore for MockStorage {
    fn name(&self) -> &str {
        "mock"
    }

    async fn verify(&self) -> Result<(), StorageError> {
        match self.verify_error.read().await.clone() {
            Some(reason) => Err(StorageError::BucketUnavailable {
                bucket: "mock-bucket".to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<u64, StorageError> {
        let delay = *self.upload_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(e) = self.next_error.write().await.take() {
            return Err(e);
        }
        if self.failing_keys.read().await.contains(remote_key) {
            return Err(StorageError::Http {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }

        let bytes = tokio::fs::metadata(local_path)
            .await
            .map_err(|_| StorageError::FileNotFound {
                path: local_path.to_path_buf(),
            })?
            .len();

        self.uploads.write().await.push(RecordedUpload {
            local_path: local_path.to_path_buf(),
            remote_key: remote_key.to_string(),
            bytes,
        });
        Ok(bytes)
    }
}
