//! On-disk blob storage and the atomic file primitives shared by every
//! component that persists state.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{CasError, CasStore, Digest, Result};

/// Replace `path` with `data` via a synced temp file in the same directory
/// and a rename, so readers see the old or the new content only.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Flush a directory entry table so a preceding rename is durable.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

/// Blobs keyed by digest under `objects/<2 hex>/<62 hex>`.
///
/// Writers race safely: each stages into its own temp file and the rename
/// of identical content onto the same name is idempotent.
pub struct BlobStore {
    objects: PathBuf,
}

impl BlobStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let objects = root.as_ref().join("objects");
        fs::create_dir_all(&objects)?;
        Ok(Self { objects })
    }

    /// Where the blob for `digest` lives, whether or not it exists yet.
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        let (shard, rest) = hex.split_at(2);
        self.objects.join(shard).join(rest)
    }
}

impl CasStore for BlobStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::compute(data);
        let path = self.path_for(&digest);
        if path.is_file() {
            return Ok(digest);
        }
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard)?;
        }
        write_atomic(&path, data)?;
        Ok(digest)
    }

    /// Reads are verified: a blob whose bytes no longer hash to its name
    /// is reported as corrupt rather than returned.
    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let data = match fs::read(self.path_for(digest)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CasError::NotFound(*digest))
            }
            Err(e) => return Err(e.into()),
        };
        let actual = Digest::compute(&data);
        if actual != *digest {
            return Err(CasError::Corrupt {
                digest: *digest,
                actual,
            });
        }
        Ok(data)
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.path_for(digest).is_file())
    }
}
