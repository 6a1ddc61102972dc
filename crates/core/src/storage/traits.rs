use async_trait::async_trait;
use std::path::Path;

use super::error::StorageError;

/// Destination for converted output files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the name of this store implementation.
    fn name(&self) -> &str;

    /// Checks the target bucket exists and is reachable.
    async fn verify(&self) -> Result<(), StorageError>;

    /// Uploads one file under `remote_key`, returning the bytes sent.
    ///
    /// Uploading the same key again overwrites the object, so a failed
    /// upload can simply be retried.
    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<u64, StorageError>;
}
