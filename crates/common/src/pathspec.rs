//! PathSpec references
//!
//! A PathSpec is a string of the form `[N@]path` pulling manifest
//! content from another file or URL. The numeric prefix requests `N`
//! parallel runs of the referenced fragment; an empty prefix means one
//! run. The legacy `pN@path` grammar is rejected.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filesystem::FsHandle;

const HTTP_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Reference to another manifest fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSpec {
    /// Number of parallel runs, at least 1
    pub parallel_runs: usize,

    /// File path or URL, relative paths resolve against the loading
    /// manifest's directory
    pub path: String,
}

impl PathSpec {
    /// Parse the `[N@]path` form. Returns `None` for anything that is
    /// not a PathSpec reference.
    pub fn parse(s: &str) -> Option<PathSpec> {
        let (prefix, path) = s.split_once('@')?;
        if path.is_empty() || path.starts_with('"') {
            return None;
        }
        let parallel_runs = if prefix.is_empty() {
            1
        } else {
            // Rejects the legacy `pN@` grammar along with any other
            // non-numeric prefix, and zero counts.
            let n: usize = prefix.parse().ok()?;
            if n == 0 {
                return None;
            }
            n
        };
        Some(PathSpec {
            parallel_runs,
            path: path.to_string(),
        })
    }

    /// Load the referenced content. Returns the raw bytes and the
    /// directory nested relative references should resolve against.
    pub fn load_contents(&self, base_dir: &Path, fs: &FsHandle) -> Result<(Vec<u8>, PathBuf)> {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            let bytes = http_get(&self.path)?;
            return Ok((bytes, base_dir.to_path_buf()));
        }

        let full = if self.path.starts_with("./") || Path::new(&self.path).is_absolute() {
            PathBuf::from(&self.path)
        } else {
            base_dir.join(&self.path)
        };

        let bytes = fs.read(&full)?;
        let dir = full.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok((bytes, dir))
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parallel_runs > 1 {
            write!(f, "{}@{}", self.parallel_runs, self.path)
        } else {
            write!(f, "@{}", self.path)
        }
    }
}

fn http_get(url: &str) -> Result<Vec<u8>> {
    let mut response = ureq::get(url)
        .config()
        .timeout_global(Some(HTTP_LOAD_TIMEOUT))
        .build()
        .call()
        .map_err(|e| Error::ManifestLoad(format!("GET {}: {}", url, e)))?;
    if response.status().as_u16() != 200 {
        return Err(Error::ManifestLoad(format!(
            "GET {}: status {}",
            url,
            response.status()
        )));
    }
    response
        .body_mut()
        .read_to_vec()
        .map_err(|e| Error::ManifestLoad(format!("GET {}: {}", url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::MemFs;
    use std::sync::Arc;

    #[test]
    fn test_parse_basic() {
        let spec = PathSpec::parse("@file.json").unwrap();
        assert_eq!(spec.parallel_runs, 1);
        assert_eq!(spec.path, "file.json");

        let spec = PathSpec::parse("5@child.json").unwrap();
        assert_eq!(spec.parallel_runs, 5);
        assert_eq!(spec.path, "child.json");
    }

    #[test]
    fn test_parse_rejects() {
        assert!(PathSpec::parse("").is_none());
        assert!(PathSpec::parse("file.json").is_none());
        assert!(PathSpec::parse("@").is_none());
        assert!(PathSpec::parse("0@file.json").is_none());
        assert!(PathSpec::parse("-1@file.json").is_none());
        assert!(PathSpec::parse("p5@file.json").is_none());
        assert!(PathSpec::parse("@\"file.json\"").is_none());
    }

    #[test]
    fn test_roundtrip() {
        for s in ["@a/b.json", "2@b.json", "17@deep/nested/c.json"] {
            let spec = PathSpec::parse(s).unwrap();
            assert_eq!(PathSpec::parse(&spec.to_string()), Some(spec));
        }
    }

    #[test]
    fn test_load_relative_to_base() {
        let fs = MemFs::new();
        fs.insert("suite/frag.json", "[]");
        let handle: FsHandle = Arc::new(fs);
        let spec = PathSpec::parse("@frag.json").unwrap();
        let (bytes, dir) = spec.load_contents(Path::new("suite"), &handle).unwrap();
        assert_eq!(bytes, b"[]");
        assert_eq!(dir, Path::new("suite"));
    }

    #[test]
    fn test_load_dot_slash_is_cwd_relative() {
        let fs = MemFs::new();
        fs.insert("./here.json", "{}");
        let handle: FsHandle = Arc::new(fs);
        let spec = PathSpec::parse("@./here.json").unwrap();
        let (bytes, _) = spec.load_contents(Path::new("elsewhere"), &handle).unwrap();
        assert_eq!(bytes, b"{}");
    }
}
