use std::path::Path;

/// Object key for `file` inside `output_dir`:
/// `[prefix/]<output_dir basename>/<path relative to output_dir>`.
///
/// Backslashes are normalized to `/` and a trailing `/` on the prefix is
/// dropped, so keys look the same whichever platform produced them.
pub fn remote_key(prefix: Option<&str>, output_dir: &Path, file: &Path) -> String {
    let folder = output_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let relative = file
        .strip_prefix(output_dir)
        .unwrap_or(file)
        .to_string_lossy()
        .replace('\\', "/");
    let relative = relative.trim_start_matches('/');

    let prefix = prefix
        .map(|p| p.replace('\\', "/"))
        .map(|p| p.trim_end_matches('/').to_string())
        .filter(|p| !p.is_empty());

    match prefix {
        Some(prefix) => format!("{}/{}/{}", prefix, folder, relative),
        None => format!("{}/{}", folder, relative),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_key_without_prefix() {
        let dir = PathBuf::from("/data/mps_rec_vrs");
        let file = dir.join("slam/summary.json");
        assert_eq!(remote_key(None, &dir, &file), "mps_rec_vrs/slam/summary.json");
    }

    #[test]
    fn test_key_with_prefix_trailing_slash_trimmed() {
        let dir = PathBuf::from("/data/mps_rec_vrs");
        let file = dir.join("eye_gaze").join("general_eye_gaze.csv");
        assert_eq!(
            remote_key(Some("project/2026/"), &dir, &file),
            "project/2026/mps_rec_vrs/eye_gaze/general_eye_gaze.csv"
        );
    }

    #[test]
    fn test_empty_prefix_is_ignored() {
        let dir = PathBuf::from("/data/mps_rec_vrs");
        let file = dir.join("a.txt");
        assert_eq!(remote_key(Some("/"), &dir, &file), "mps_rec_vrs/a.txt");
    }

    #[test]
    fn test_backslashes_normalized() {
        let dir = PathBuf::from("/data/mps_rec_vrs");
        let file = dir.join("slam\\semidense_points.csv.gz");
        assert_eq!(
            remote_key(Some("a\\b"), &dir, &file),
            "a/b/mps_rec_vrs/slam/semidense_points.csv.gz"
        );
    }
}
