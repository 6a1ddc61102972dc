//! On-disk layout of a converted recording's output directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Files that make up a complete output set, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLayout {
    /// Required data files (eye gaze, hand tracking, SLAM).
    #[serde(default = "default_required_files")]
    pub required_files: Vec<PathBuf>,

    /// Summary manifest written last by the service; must parse as JSON.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
}

fn default_required_files() -> Vec<PathBuf> {
    vec![
        PathBuf::from("eye_gaze/general_eye_gaze.csv"),
        PathBuf::from("hand_tracking/hand_tracking_results.csv"),
        PathBuf::from("slam/closed_loop_trajectory.csv"),
        PathBuf::from("slam/semidense_points.csv.gz"),
    ]
}

fn default_manifest() -> PathBuf {
    PathBuf::from("slam/summary.json")
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self {
            required_files: default_required_files(),
            manifest: default_manifest(),
        }
    }
}

impl OutputLayout {
    /// Every path checked for completeness, manifest last.
    pub fn all_paths(&self) -> impl Iterator<Item = &Path> {
        self.required_files
            .iter()
            .map(PathBuf::as_path)
            .chain(std::iter::once(self.manifest.as_path()))
    }
}

/// Name of the directory the conversion tool produces for `input`.
pub fn output_dir_name(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "recording".to_string());
    format!("mps_{}_vrs", stem)
}

/// Output directory for `input`: next to it, or under `output_root` when given.
pub fn output_dir_for(input: &Path, output_root: Option<&Path>) -> PathBuf {
    let base = match output_root {
        Some(root) => root.to_path_buf(),
        None => input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    base.join(output_dir_name(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let layout = OutputLayout::default();
        assert_eq!(layout.required_files.len(), 4);
        assert_eq!(layout.all_paths().count(), 5);
        assert_eq!(
            layout.all_paths().last().unwrap(),
            Path::new("slam/summary.json")
        );
    }

    #[test]
    fn test_output_dir_next_to_input() {
        let dir = output_dir_for(Path::new("/data/rec/session_01.vrs"), None);
        assert_eq!(dir, PathBuf::from("/data/rec/mps_session_01_vrs"));
    }

    #[test]
    fn test_output_dir_under_root() {
        let dir = output_dir_for(
            Path::new("/data/rec/session_01.VRS"),
            Some(Path::new("/out")),
        );
        assert_eq!(dir, PathBuf::from("/out/mps_session_01_vrs"));
    }

    #[test]
    fn test_layout_from_toml_uses_defaults() {
        let layout: OutputLayout = toml::from_str(r#"manifest = "summary.json""#).unwrap();
        assert_eq!(layout.manifest, PathBuf::from("summary.json"));
        assert_eq!(layout.required_files, default_required_files());
    }
}
