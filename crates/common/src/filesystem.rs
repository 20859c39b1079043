//! Filesystem abstraction for manifest loading
//!
//! Manifests, template includes, CSV fixtures, and multipart bodies are
//! all read through this trait so suites can run against an in-memory
//! tree in tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Read access to manifest content
pub trait Filesystem: Send + Sync {
    /// Read the full contents of a file
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Whether a file exists
    fn exists(&self, path: &Path) -> bool;
}

/// Shared handle to a filesystem implementation
pub type FsHandle = Arc<dyn Filesystem>;

/// Real on-disk filesystem
#[derive(Debug, Default)]
pub struct DiskFs;

impl Filesystem for DiskFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|e| {
            Error::ManifestLoad(format!("cannot read '{}': {}", path.display(), e))
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// In-memory filesystem for tests
#[derive(Debug, Default)]
pub struct MemFs {
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file
    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        self.files.write().insert(path.into(), content.into());
    }
}

impl Filesystem for MemFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::ManifestLoad(format!("cannot read '{}': not found", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memfs_roundtrip() {
        let fs = MemFs::new();
        fs.insert("a/b.json", b"{}".to_vec());
        assert!(fs.exists(Path::new("a/b.json")));
        assert_eq!(fs.read(Path::new("a/b.json")).unwrap(), b"{}");
        assert!(fs.read(Path::new("missing")).is_err());
    }
}
