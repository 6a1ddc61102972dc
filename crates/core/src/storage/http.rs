//! Object store speaking the GCS JSON API over HTTP.

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, RequestBuilder, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::config::StorageConfig;
use super::error::StorageError;
use super::traits::ObjectStore;

/// Uploads with a single media request per file.
pub struct HttpObjectStore {
    client: Client,
    config: StorageConfig,
}

impl HttpObjectStore {
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        if !config.is_configured() {
            return Err(StorageError::NotConfigured(
                "bucket name is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn endpoint(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    fn bucket_url(&self) -> String {
        format!(
            "{}/storage/v1/b/{}",
            self.endpoint(),
            urlencoding::encode(&self.config.bucket)
        )
    }

    fn upload_url(&self, remote_key: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint(),
            urlencoding::encode(&self.config.bucket),
            urlencoding::encode(remote_key)
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.access_token.as_deref() {
            Some(token) if !token.is_empty() => request.bearer_auth(token),
            _ => request,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> StorageError {
        if e.is_timeout() {
            StorageError::Timeout {
                timeout_secs: self.config.request_timeout_secs,
            }
        } else {
            StorageError::from(e)
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn name(&self) -> &str {
        "gcs_http"
    }

    async fn verify(&self) -> Result<(), StorageError> {
        debug!(bucket = %self.config.bucket, "Verifying bucket");
        let response = self
            .authorize(self.client.get(self.bucket_url()))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status.is_success() {
            info!(bucket = %self.config.bucket, "Bucket verified");
            return Ok(());
        }

        let reason = match status {
            StatusCode::NOT_FOUND => "bucket does not exist".to_string(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "access denied".to_string(),
            _ => {
                let body = response.text().await.unwrap_or_default();
                return Err(StorageError::Http {
                    status: status.as_u16(),
                    body,
                });
            }
        };
        Err(StorageError::BucketUnavailable {
            bucket: self.config.bucket.clone(),
            reason,
        })
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<u64, StorageError> {
        let file = tokio::fs::File::open(local_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::FileNotFound {
                    path: local_path.to_path_buf(),
                }
            } else {
                StorageError::Io(e)
            }
        })?;
        let size = file.metadata().await?.len();

        debug!(key = %remote_key, size, "Uploading {}", local_path.display());

        let body = Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .authorize(self.client.post(self.upload_url(remote_key)))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> HttpObjectStore {
        HttpObjectStore::new(
            StorageConfig::default()
                .with_bucket("aria-data")
                .with_endpoint("http://localhost:4443/"),
        )
        .unwrap()
    }

    #[test]
    fn test_requires_bucket() {
        let result = HttpObjectStore::new(StorageConfig::default());
        assert!(matches!(result, Err(StorageError::NotConfigured(_))));
    }

    #[test]
    fn test_urls() {
        let store = store();
        assert_eq!(
            store.bucket_url(),
            "http://localhost:4443/storage/v1/b/aria-data"
        );
        assert_eq!(
            store.upload_url("runs/mps_a_vrs/slam/summary.json"),
            "http://localhost:4443/upload/storage/v1/b/aria-data/o?uploadType=media&name=runs%2Fmps_a_vrs%2Fslam%2Fsummary.json"
        );
    }

    #[tokio::test]
    async fn test_upload_missing_file() {
        let err = store()
            .upload(Path::new("/nonexistent/file.csv"), "k")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::FileNotFound { .. }));
    }
}
