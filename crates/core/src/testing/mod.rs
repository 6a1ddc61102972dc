//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of both collaborator traits,
//! allowing whole runs to be tested without the aria CLI or a bucket.
//!
//! # Example
//!
//! ```rust,ignore
//! use mps_relay_core::testing::{MockConversionService, MockStorage};
//!
//! let service = Arc::new(MockConversionService::new());
//! let storage = Arc::new(MockStorage::new());
//!
//! // Configure mock behavior
//! service.set_processing_polls(3).await;
//! storage.fail_key("mps_a_vrs/slam/summary.json").await;
//! ```

mod mock_conversion;
mod mock_storage;

pub use mock_conversion::{MockCall, MockConversionService, RecordedCall};
pub use mock_storage::{MockStorage, RecordedUpload};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::path::{Path, PathBuf};

    use crate::cache::OutputLayout;

    /// Writes a small non-empty input recording named `name` under `dir`.
    pub fn write_input(dir: &Path, name: &str) -> PathBuf {
        std::fs::create_dir_all(dir).expect("create input dir");
        let path = dir.join(name);
        std::fs::write(&path, b"VRS\x00recording").expect("write input");
        path
    }

    /// Writes every file of `layout` under `output_dir`, manifest included.
    pub fn write_complete_output(output_dir: &Path, layout: &OutputLayout) {
        for file in &layout.required_files {
            write_file(&output_dir.join(file), b"timestamp,value\n0,1\n");
        }
        write_file(
            &output_dir.join(&layout.manifest),
            br#"{"status": "SUCCESS", "version": 1}"#,
        );
    }

    /// Writes the layout minus its manifest, as an interrupted run leaves it.
    pub fn write_partial_output(output_dir: &Path, layout: &OutputLayout) {
        for file in &layout.required_files {
            write_file(&output_dir.join(file), b"timestamp,value\n");
        }
    }

    fn write_file(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create output dir");
        }
        std::fs::write(path, contents).expect("write output file");
    }
}
