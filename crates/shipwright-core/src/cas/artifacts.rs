//! Artifact Store: source blobs in the CAS plus a JSON sidecar per digest.
//!
//! Layout under the store root:
//!
//! ```text
//! objects/<2 hex>/<62 hex>     normalized source bytes
//! meta/<64 hex>.json           ArtifactMeta (language, size, first_seen)
//! ```
//!
//! Used by the sandbox runner to stage content into scratch directories and
//! by the deployment manager to persist deployed versions.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::domain::{Language, SourceArtifact};

use super::fs::{write_atomic, BlobStore};
use super::{CasError, CasStore, Digest, Result};

/// Sidecar metadata stored next to each artifact blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub digest: Digest,
    pub language: Language,
    pub size_bytes: u64,
    pub first_seen: DateTime<Utc>,
}

/// Content-addressed artifact storage with dedup on `content_hash`.
pub struct ArtifactStore {
    blobs: BlobStore,
    meta_dir: PathBuf,
}

impl ArtifactStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let blobs = BlobStore::open(root)?;
        let meta_dir = root.join("meta");
        fs::create_dir_all(&meta_dir)?;
        Ok(Self { blobs, meta_dir })
    }

    /// Persist `artifact`. Returns its digest; storing the same content
    /// twice is a no-op and keeps the original `first_seen`.
    pub fn put(&self, artifact: &SourceArtifact) -> Result<Digest> {
        let digest = self.blobs.put(artifact.content())?;
        debug_assert_eq!(digest, artifact.content_hash());

        let meta_path = self.meta_path(&digest);
        if !meta_path.exists() {
            let meta = ArtifactMeta {
                digest,
                language: artifact.language(),
                size_bytes: artifact.len() as u64,
                first_seen: Utc::now(),
            };
            write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?)?;
        }
        Ok(digest)
    }

    /// Load an artifact back, verifying its content against `digest`.
    pub fn get(&self, digest: &Digest) -> Result<SourceArtifact> {
        let meta = self.meta(digest)?;
        let content = self.blobs.get(digest)?;
        Ok(SourceArtifact::new(content, meta.language))
    }

    pub fn meta(&self, digest: &Digest) -> Result<ArtifactMeta> {
        let raw = fs::read(self.meta_path(digest)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::NotFound(*digest)
            } else {
                CasError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn contains(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blobs.exists(digest)? && self.meta_path(digest).exists())
    }

    fn meta_path(&self, digest: &Digest) -> PathBuf {
        self.meta_dir.join(format!("{}.json", digest.to_hex()))
    }
}

/// Write `artifact` into `dir` as its language's entry file and return the
/// path. The file is made read-only.
pub fn materialize(artifact: &SourceArtifact, dir: &Path) -> std::io::Result<PathBuf> {
    let path = dir.join(artifact.language().entry_file());
    let mut file = fs::File::create(&path)?;
    file.write_all(artifact.content())?;
    file.sync_all()?;

    let mut perms = file.metadata()?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(&path, perms)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip_keeps_language() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let artifact = SourceArtifact::new("console.log('hi')", Language::JavaScript);

        let digest = store.put(&artifact).unwrap();
        assert_eq!(digest, artifact.content_hash());

        let back = store.get(&digest).unwrap();
        assert_eq!(back, artifact);
        assert!(store.contains(&digest).unwrap());
    }

    #[test]
    fn second_put_keeps_first_seen() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let artifact = SourceArtifact::new("echo same", Language::Shell);

        let digest = store.put(&artifact).unwrap();
        let first = store.meta(&digest).unwrap();
        store.put(&artifact).unwrap();
        assert_eq!(store.meta(&digest).unwrap().first_seen, first.first_seen);
    }

    #[test]
    fn missing_digest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let missing = Digest::compute(b"nothing here");
        assert!(matches!(store.get(&missing), Err(CasError::NotFound(_))));
    }

    #[test]
    fn materialize_writes_entry_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = SourceArtifact::new("print('x')", Language::Python);
        let path = materialize(&artifact, dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "main.py");
        assert_eq!(std::fs::read(&path).unwrap(), b"print('x')\n");
        assert!(std::fs::metadata(&path).unwrap().permissions().readonly());
    }
}
