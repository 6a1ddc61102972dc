//! One-shot checks run before a job takes a concurrency slot.
//!
//! Neither check can be fixed by retrying, so failures are permanent.

use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::{debug, info, warn};

use crate::job::{Job, JobError};

/// Checks the input is a non-empty regular file and returns its size.
pub fn validate_input(path: &Path) -> Result<u64, JobError> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(JobError::validation(path, "file not found"));
        }
        Err(e) => return Err(JobError::validation(path, e.to_string())),
    };

    if !meta.is_file() {
        return Err(JobError::validation(path, "not a regular file"));
    }
    if meta.len() == 0 {
        return Err(JobError::validation(path, "file is empty"));
    }

    let is_vrs = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("vrs"));
    if !is_vrs {
        warn!(path = %path.display(), "File does not have a .vrs extension");
    }

    info!(path = %path.display(), size = meta.len(), "Input validated");
    Ok(meta.len())
}

/// Free bytes on the disk holding `path`, or `None` when no disk matches.
///
/// Picks the disk with the longest mount point containing the nearest
/// existing ancestor of `path`.
pub fn available_space_for(path: &Path) -> Option<u64> {
    let existing = nearest_existing_ancestor(path)?;
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| existing.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .and_then(|p| std::fs::canonicalize(p).ok())
}

/// Input validation plus a free-space check sized from the input.
#[derive(Debug, Clone)]
pub struct Preflight {
    disk_space_multiplier: f64,
}

impl Preflight {
    /// `disk_space_multiplier` times the input size must be free where the
    /// output will be written. Zero disables the disk check.
    pub fn new(disk_space_multiplier: f64) -> Self {
        Self {
            disk_space_multiplier,
        }
    }

    pub fn check(&self, job: &Job) -> Result<(), JobError> {
        let size = validate_input(&job.input_path)?;
        if self.disk_space_multiplier <= 0.0 {
            return Ok(());
        }

        let required = (size as f64 * self.disk_space_multiplier).ceil() as u64;
        match available_space_for(&job.output_dir) {
            Some(available) if available < required => Err(JobError::InsufficientDiskSpace {
                path: job.output_dir.clone(),
                required_bytes: required,
                available_bytes: available,
            }),
            Some(available) => {
                debug!(job_id = %job.id, required, available, "Disk space ok");
                Ok(())
            }
            None => {
                debug!(job_id = %job.id, "No disk found for output path, skipping space check");
                Ok(())
            }
        }
    }
}

impl Default for Preflight {
    fn default() -> Self {
        Self::new(1.5)
    }
}
