//! JSON manifest of cached assets.
//!
//! The manifest lives at `<root>/manifest.json` and records, per cache key,
//! the relative file path, size, SHA-256, source href and retrieval time.
//! It is rewritten atomically after every install.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::CacheError;

/// File name of the manifest inside the cache root.
pub const MANIFEST_FILE: &str = "manifest.json";

const MANIFEST_VERSION: u32 = 1;

/// One cached asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the cache root.
    pub path: String,
    pub size: u64,
    pub sha256: String,
    pub href: String,
    pub retrieved_at: DateTime<Utc>,
}

/// All cached assets keyed by `<granule id>/<band>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// Loads the manifest from `root`.
    ///
    /// A missing manifest is an empty cache. An unreadable or corrupt one is
    /// logged and treated as empty, so every asset is re-validated by download.
    pub fn load(root: &Path) -> Self {
        let path = root.join(MANIFEST_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read cache manifest, starting empty");
                return Self::default();
            }
        };

        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cache manifest, starting empty");
                Self::default()
            }
        }
    }

    /// Writes the manifest to `root` via a temporary file and rename.
    pub fn save(&self, root: &Path) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(root, &root.join(MANIFEST_FILE), &bytes)
    }
}

/// Writes `bytes` to `target` by persisting a temporary file created in `dir`.
///
/// `dir` must be on the same filesystem as `target` for the rename to be
/// atomic.
pub(crate) fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| CacheError::io(temp.path(), e))?;
    temp.persist(target)
        .map_err(|e| CacheError::io(target, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry() -> ManifestEntry {
        ManifestEntry {
            path: "HLS.S30.T10SEG.2021152T184919.v2.0/HLS.S30.T10SEG.2021152T184919.v2.0.B04.tif"
                .into(),
            size: 42,
            sha256: "ab".repeat(32),
            href: "https://data/B04.tif".into(),
            retrieved_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let temp = TempDir::new().unwrap();
        assert_eq!(Manifest::load(temp.path()), Manifest::default());
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let mut manifest = Manifest::default();
        manifest
            .entries
            .insert("HLS.S30.T10SEG.2021152T184919.v2.0/B04".into(), entry());
        manifest.save(temp.path()).unwrap();

        let loaded = Manifest::load(temp.path());
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_corrupt_manifest_is_empty() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(MANIFEST_FILE), b"{not json").unwrap();
        assert!(Manifest::load(temp.path()).entries.is_empty());
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("out.bin");
        write_atomic(temp.path(), &target, b"payload").unwrap();
        write_atomic(temp.path(), &target, b"payload2").unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"payload2");
        let files: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }
}
