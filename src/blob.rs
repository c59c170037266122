//! Raw blob storage behind a two-method capability interface.
//!
//! Keys are opaque, source-prefixed strings generated at scrape time. The
//! filesystem backend maps key segments to directories; tests use the
//! in-memory backend.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
}

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create blob dir {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // keys are generated, but never trust them as paths
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' || c == '/' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let safe = safe.replace("..", "_");
        self.root.join(safe)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&path, bytes).with_context(|| format!("write blob {key}"))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        std::fs::read(self.path_for(key)).with_context(|| format!("read blob {key}"))
    }
}

/// In-memory backend for tests and dry runs.
#[derive(Default)]
pub struct MemBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .with_context(|| format!("missing blob {key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        store.put("src-mobile/M1/1", b"<html>ad</html>").unwrap();
        assert_eq!(store.get("src-mobile/M1/1").unwrap(), b"<html>ad</html>");
    }

    #[test]
    fn traversal_is_neutralized() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        store.put("../../etc/passwd", b"x").unwrap();
        // lands inside the root, not above it
        assert!(store.get("../../etc/passwd").is_ok());
        assert!(!dir.path().parent().unwrap().join("etc").exists());
    }
}
