//! On-disk layout of one deployment name.
//!
//! ```text
//! <root>/<name>/ACTIVE              "v<N>", replaced by rename
//! <root>/<name>/SEQ                 last allocated version
//! <root>/<name>/v<N>/               immutable version directory
//! <root>/<name>/logs/deployment.log
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::cas::fs::write_atomic;

use super::error::{DeployError, DeployResult};

/// Prefix of the lines the manager writes into the deployment log when the
/// active version changes. The monitor only scans text after the last one.
pub const LOG_SECTION_MARKER: &str = "### shipwright";

const POINTER_FILE: &str = "ACTIVE";
const SEQ_FILE: &str = "SEQ";
const META_FILE: &str = "metadata.json";
pub(crate) const LOG_DIR: &str = "logs";
pub(crate) const LOG_FILE: &str = "deployment.log";

/// Top-level entries of the deployment root that are not deployment names.
const RESERVED: [&str; 2] = ["objects", "meta"];

/// Accept names that are safe as a single path component.
pub(crate) fn validate_name(name: &str) -> DeployResult<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric());
    if name.len() > 128 || !valid_chars || !starts_ok || RESERVED.contains(&name) {
        return Err(DeployError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Paths for one deployment name.
#[derive(Debug, Clone)]
pub(crate) struct NameLayout {
    dir: PathBuf,
}

impl NameLayout {
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            dir: root.join(name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    pub fn version_dir(&self, version: u64) -> PathBuf {
        self.dir.join(format!("v{version}"))
    }

    pub fn meta_path(&self, version: u64) -> PathBuf {
        self.version_dir(version).join(META_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join(LOG_DIR)
    }

    pub fn log_path(&self) -> PathBuf {
        self.logs_dir().join(LOG_FILE)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir
            .join(format!(".staging-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.dir.join(format!(".trash-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Version named by the active pointer, if any.
    pub fn read_pointer(&self) -> io::Result<Option<u64>> {
        read_version_file(&self.dir.join(POINTER_FILE), true)
    }

    /// Atomically point `ACTIVE` at `version`.
    pub fn write_pointer(&self, version: u64) -> io::Result<()> {
        write_atomic(&self.dir.join(POINTER_FILE), format!("v{version}\n").as_bytes())
    }

    pub fn clear_pointer(&self) -> io::Result<()> {
        match fs::remove_file(self.dir.join(POINTER_FILE)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Last allocated version, falling back to the highest version directory
    /// when `SEQ` is missing.
    pub fn read_seq(&self) -> io::Result<u64> {
        match read_version_file(&self.dir.join(SEQ_FILE), false)? {
            Some(seq) => Ok(seq),
            None => Ok(self.versions()?.into_iter().max().unwrap_or(0)),
        }
    }

    pub fn has_seq_file(&self) -> bool {
        self.dir.join(SEQ_FILE).is_file()
    }

    pub fn write_seq(&self, seq: u64) -> io::Result<()> {
        write_atomic(&self.dir.join(SEQ_FILE), format!("{seq}\n").as_bytes())
    }

    /// Committed version numbers, ascending.
    pub fn versions(&self) -> io::Result<Vec<u64>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(v) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.parse::<u64>().ok())
            {
                versions.push(v);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

fn read_version_file(path: &Path, prefixed: bool) -> io::Result<Option<u64>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let trimmed = raw.trim();
    let digits = if prefixed {
        trimmed.strip_prefix('v').unwrap_or(trimmed)
    } else {
        trimmed
    };
    digits.parse::<u64>().map(Some).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} does not hold a version: {trimmed:?}", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        for ok in ["svc", "my-app_2", "a.b", "X1"] {
            assert!(validate_name(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", ".hidden", "../up", "a/b", "objects", "meta", "sp ace"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_name(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_pointer_roundtrip_and_clear() {
        let root = tempfile::tempdir().unwrap();
        let layout = NameLayout::new(root.path(), "svc");
        fs::create_dir_all(layout.dir()).unwrap();

        assert_eq!(layout.read_pointer().unwrap(), None);
        layout.write_pointer(3).unwrap();
        assert_eq!(layout.read_pointer().unwrap(), Some(3));
        assert_eq!(
            fs::read_to_string(layout.dir().join("ACTIVE")).unwrap(),
            "v3\n"
        );
        layout.clear_pointer().unwrap();
        layout.clear_pointer().unwrap();
        assert_eq!(layout.read_pointer().unwrap(), None);
    }

    #[test]
    fn test_seq_falls_back_to_version_dirs() {
        let root = tempfile::tempdir().unwrap();
        let layout = NameLayout::new(root.path(), "svc");
        assert_eq!(layout.read_seq().unwrap(), 0);

        fs::create_dir_all(layout.version_dir(2)).unwrap();
        fs::create_dir_all(layout.version_dir(5)).unwrap();
        fs::create_dir_all(layout.dir().join(".staging-abc")).unwrap();
        assert_eq!(layout.versions().unwrap(), vec![2, 5]);
        assert_eq!(layout.read_seq().unwrap(), 5);

        layout.write_seq(9).unwrap();
        assert_eq!(layout.read_seq().unwrap(), 9);
    }

    #[test]
    fn test_garbage_pointer_is_invalid_data() {
        let root = tempfile::tempdir().unwrap();
        let layout = NameLayout::new(root.path(), "svc");
        fs::create_dir_all(layout.dir()).unwrap();
        fs::write(layout.dir().join("ACTIVE"), "latest").unwrap();
        let err = layout.read_pointer().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
