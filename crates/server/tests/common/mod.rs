//! Common test utilities for API testing with mocks.
//!
//! This module provides a test fixture that creates an in-process router
//! with mock collaborators injected, so runs can be driven end to end
//! without the aria CLI or a bucket.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use mps_relay_core::{
    executor::StageTimeouts,
    retry::RetryConfig,
    testing::{MockConversionService, MockStorage},
    Config, ConversionService, JobOrchestrator, OrchestratorConfig, OutputLayout, StorageConfig,
};
use mps_relay_server::state::AppState;

/// Re-export fixtures for test convenience
pub use mps_relay_core::testing::fixtures;

/// Test fixture with an in-process router and controllable mocks.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_run_creation() {
///     let fixture = TestFixture::new();
///     let inputs = fixture.inputs(2);
///
///     let response = fixture.post("/api/v1/runs", json!({
///         "inputs": inputs,
///         "mode": "convert_only"
///     })).await;
///
///     assert_eq!(response.status, 201);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    /// Mock conversion service - inject failures and delays
    pub service: Arc<MockConversionService>,
    /// Mock object store - inspect uploads, fail keys
    pub storage: Arc<MockStorage>,
    /// Shared state, for reaching run handles directly
    pub state: Arc<AppState>,
    /// Temporary directory holding inputs and outputs
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Create a fixture with storage configured.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Create a fixture without object storage.
    pub fn without_storage() -> Self {
        Self::build(false)
    }

    fn build(with_storage: bool) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = Arc::new(MockConversionService::new());
        let storage = Arc::new(MockStorage::new());

        let mut config = Config::default();
        config.orchestrator = OrchestratorConfig::default()
            .with_poll_interval_ms(10)
            .with_disk_space_multiplier(0.0)
            .with_retry(RetryConfig::immediate(3))
            .with_timeouts(StageTimeouts::uniform(30));
        if with_storage {
            config.storage = StorageConfig::default().with_bucket("recordings");
        }

        let converter: Arc<dyn ConversionService> = service.clone();
        let mut orchestrator = JobOrchestrator::new(
            config.orchestrator.clone(),
            OutputLayout::default(),
            converter,
        );
        if with_storage {
            orchestrator = orchestrator.with_storage(storage.clone(), &config.storage);
        }

        let state = Arc::new(AppState::new(config, Arc::new(orchestrator)));
        let router = mps_relay_server::api::create_router(Arc::clone(&state));

        Self {
            router,
            service,
            storage,
            state,
            temp_dir,
        }
    }

    /// Write `count` input recordings and return their paths.
    pub fn inputs(&self, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| fixtures::write_input(self.temp_dir.path(), &format!("rec_{}.vrs", i)))
            .collect()
    }

    /// Poll `GET /api/v1/runs/{id}` until the report appears.
    pub async fn wait_for_report(&self, run_id: &str) -> Value {
        for _ in 0..500 {
            let response = self.get(&format!("/api/v1/runs/{}", run_id)).await;
            if !response.body["report"].is_null() {
                return response.body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} did not finish in time", run_id);
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a PUT request with JSON body.
    pub async fn put(&self, path: &str, body: Value) -> TestResponse {
        self.request("PUT", path, Some(body)).await
    }

    /// Send a request with raw string body (for testing malformed JSON).
    pub async fn post_raw(&self, path: &str, body: &str) -> TestResponse {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        self.send(request_builder.body(body).unwrap()).await
    }

    async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}
