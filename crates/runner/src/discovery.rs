//! Suite discovery
//!
//! Walks root directories looking for `manifest.json`. Directories
//! whose name starts with `_` hold shared resources and are pruned.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Collect every suite manifest under `root`, sorted by path.
pub fn discover_manifests(root: &Path) -> Vec<PathBuf> {
    let mut manifests: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .map(|n| n.starts_with('_'))
                    .unwrap_or(false))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file() && entry.file_name() == MANIFEST_FILENAME
        })
        .map(|entry| entry.into_path())
        .collect();
    manifests.sort();
    debug!(root = %root.display(), count = manifests.len(), "discovered manifests");
    manifests
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_discovers_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::create_dir_all(root.join("suite_a")).unwrap();
        fs::write(root.join("suite_a/manifest.json"), "{}").unwrap();
        fs::create_dir_all(root.join("suite_b/nested")).unwrap();
        fs::write(root.join("suite_b/nested/manifest.json"), "{}").unwrap();
        fs::create_dir_all(root.join("_res")).unwrap();
        fs::write(root.join("_res/manifest.json"), "{}").unwrap();
        fs::write(root.join("suite_a/other.json"), "{}").unwrap();

        let found = discover_manifests(root);
        assert_eq!(
            found,
            vec![
                root.join("suite_a/manifest.json"),
                root.join("suite_b/nested/manifest.json"),
            ]
        );
    }
}
