//! Deployment records and their on-disk metadata form.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::layout::{LOG_DIR, LOG_FILE};
use crate::cas::Digest;
use crate::domain::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Active,
    Inactive,
    /// The version directory was committed but could never be activated.
    Failed,
    /// Was active until an operator rolled back past it.
    RolledBack,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Active => "active",
            DeploymentStatus::Inactive => "inactive",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// One version of a named deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub name: String,
    pub source_hash: Digest,
    pub language: Language,
    pub created_at: DateTime<Utc>,
    /// Version directory holding the entry file and metadata.
    pub path: PathBuf,
    pub status: DeploymentStatus,
    pub version: u64,
}

impl DeploymentRecord {
    /// Path of the deployed entry file.
    pub fn entry_path(&self) -> PathBuf {
        self.path.join(self.language.entry_file())
    }

    /// Deployment log shared by every version of this name.
    pub fn log_path(&self) -> PathBuf {
        let name_dir = self.path.parent().unwrap_or(&self.path);
        name_dir.join(LOG_DIR).join(LOG_FILE)
    }

    pub fn is_active(&self) -> bool {
        self.status == DeploymentStatus::Active
    }

    pub(crate) fn to_meta(&self) -> VersionMeta {
        VersionMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            source_hash: self.source_hash,
            language: self.language,
            created_at: self.created_at,
            status: self.status,
            version: self.version,
        }
    }
}

/// Contents of `v<N>/metadata.json`. The path is implied by where the file
/// lives, so it is not stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct VersionMeta {
    pub id: String,
    pub name: String,
    pub source_hash: Digest,
    pub language: Language,
    pub created_at: DateTime<Utc>,
    pub status: DeploymentStatus,
    pub version: u64,
}

impl VersionMeta {
    pub fn into_record(self, path: &Path) -> DeploymentRecord {
        DeploymentRecord {
            id: self.id,
            name: self.name,
            source_hash: self.source_hash,
            language: self.language,
            created_at: self.created_at,
            path: path.to_path_buf(),
            status: self.status,
            version: self.version,
        }
    }
}
