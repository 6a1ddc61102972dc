//! Read-only completeness check of an output directory.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use super::layout::OutputLayout;
use crate::job::Job;
use crate::metrics;

/// A filesystem error hit while probing. Never fatal: it degrades to a miss.
#[derive(Debug, Clone, Error, Serialize)]
#[error("cache check failed for {path}: {message}")]
pub struct CacheCheckError {
    pub path: PathBuf,
    pub message: String,
}

/// Outcome of a probe.
#[derive(Debug, Clone, Serialize)]
pub struct CacheResult {
    pub hit: bool,
    pub output_dir: PathBuf,
    /// Required paths that were absent, empty or unreadable.
    pub missing: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CacheCheckError>,
}

/// Decides whether a job's output already exists and is complete.
#[derive(Debug, Clone, Default)]
pub struct CacheProbe {
    layout: OutputLayout,
}

impl CacheProbe {
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn probe(&self, job: &Job) -> CacheResult {
        self.probe_dir(&job.output_dir)
    }

    /// Every required file and the manifest must exist with non-zero size,
    /// and the manifest must parse as JSON.
    pub fn probe_dir(&self, output_dir: &Path) -> CacheResult {
        let mut result = CacheResult {
            hit: false,
            output_dir: output_dir.to_path_buf(),
            missing: Vec::new(),
            error: None,
        };

        match std::fs::metadata(output_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                result.missing.push(output_dir.to_path_buf());
                metrics::CACHE_PROBES.with_label_values(&["miss"]).inc();
                return result;
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    result.error = Some(check_error(output_dir, &e));
                }
                result.missing.push(output_dir.to_path_buf());
                metrics::CACHE_PROBES.with_label_values(&["miss"]).inc();
                return result;
            }
        }

        for rel in self.layout.required_files.iter() {
            let path = output_dir.join(rel);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {}
                Ok(_) => result.missing.push(rel.clone()),
                Err(e) => {
                    if e.kind() != io::ErrorKind::NotFound && result.error.is_none() {
                        result.error = Some(check_error(&path, &e));
                    }
                    result.missing.push(rel.clone());
                }
            }
        }

        let manifest = output_dir.join(&self.layout.manifest);
        match std::fs::read(&manifest) {
            Ok(bytes) if bytes.is_empty() => result.missing.push(self.layout.manifest.clone()),
            Ok(bytes) => {
                if let Err(e) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                    debug!(path = %manifest.display(), "Manifest is not valid JSON: {}", e);
                    result.missing.push(self.layout.manifest.clone());
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound && result.error.is_none() {
                    result.error = Some(check_error(&manifest, &e));
                }
                result.missing.push(self.layout.manifest.clone());
            }
        }

        if let Some(err) = &result.error {
            warn!("{}; treating as cache miss", err);
        }

        result.hit = result.missing.is_empty() && result.error.is_none();
        metrics::CACHE_PROBES
            .with_label_values(&[if result.hit { "hit" } else { "miss" }])
            .inc();
        result
    }
}

fn check_error(path: &Path, e: &io::Error) -> CacheCheckError {
    CacheCheckError {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::write_complete_output;
    use tempfile::TempDir;

    #[test]
    fn test_missing_directory_is_miss() {
        let temp = TempDir::new().unwrap();
        let result = CacheProbe::default().probe_dir(&temp.path().join("mps_x_vrs"));
        assert!(!result.hit);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_complete_directory_is_hit() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("mps_x_vrs");
        write_complete_output(&out, &OutputLayout::default());

        let result = CacheProbe::default().probe_dir(&out);
        assert!(result.hit, "missing: {:?}", result.missing);
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_zero_length_file_is_miss() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("mps_x_vrs");
        let layout = OutputLayout::default();
        write_complete_output(&out, &layout);
        std::fs::write(out.join(&layout.required_files[1]), b"").unwrap();

        let result = CacheProbe::default().probe_dir(&out);
        assert!(!result.hit);
        assert_eq!(result.missing, vec![layout.required_files[1].clone()]);
    }

    #[test]
    fn test_unparseable_manifest_is_miss() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("mps_x_vrs");
        let layout = OutputLayout::default();
        write_complete_output(&out, &layout);
        std::fs::write(out.join(&layout.manifest), b"{ not json").unwrap();

        let result = CacheProbe::default().probe_dir(&out);
        assert!(!result.hit);
        assert_eq!(result.missing, vec![layout.manifest.clone()]);
    }

    #[test]
    fn test_partial_output_reports_every_gap() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("mps_x_vrs");
        std::fs::create_dir_all(out.join("slam")).unwrap();
        std::fs::write(out.join("slam/closed_loop_trajectory.csv"), b"t,x,y,z\n").unwrap();

        let result = CacheProbe::default().probe_dir(&out);
        assert!(!result.hit);
        assert_eq!(result.missing.len(), 4);
    }

    #[test]
    fn test_output_path_is_a_file() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("mps_x_vrs");
        std::fs::write(&out, b"oops").unwrap();

        let result = CacheProbe::default().probe_dir(&out);
        assert!(!result.hit);
    }
}
