//! The deployment manager: versioned, content-addressed deployments with a
//! single atomically swapped active pointer per name.
//!
//! Writers for one name are serialized by an async mutex owned by that
//! name. Readers never lock: the status they report is derived from the
//! `ACTIVE` pointer, which only ever changes by rename.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use super::error::{DeployError, DeployResult};
use super::layout::{validate_name, NameLayout, LOG_SECTION_MARKER};
use super::record::{DeploymentRecord, DeploymentStatus, VersionMeta};
use crate::cas::artifacts::{materialize, ArtifactStore};
use crate::cas::fs::{sync_dir, write_atomic};
use crate::domain::{Language, SourceArtifact};
use crate::metrics::METRICS;
use crate::obs;

pub struct DeploymentManager {
    root: PathBuf,
    artifacts: ArtifactStore,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeploymentManager {
    /// Open (creating if needed) a deployment root.
    pub fn open(root: impl AsRef<Path>) -> DeployResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let artifacts = ArtifactStore::open(&root)?;
        Ok(Self {
            root,
            artifacts,
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Deploy `artifact` under `name` and make it the active version.
    ///
    /// Deploying the content that is already active returns the existing
    /// record unchanged. Otherwise a new version directory is staged,
    /// renamed into place, and only then is the pointer swapped.
    pub async fn deploy(
        &self,
        artifact: &SourceArtifact,
        name: &str,
        language: Language,
    ) -> DeployResult<DeploymentRecord> {
        validate_name(name)?;
        if artifact.language() != language {
            return Err(DeployError::LanguageMismatch {
                artifact: artifact.language(),
                requested: language,
            });
        }

        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let layout = NameLayout::new(&self.root, name);
        fs::create_dir_all(layout.dir())?;
        let digest = self.artifacts.put(artifact)?;

        let previous = layout.read_pointer()?;
        if let Some(active) = previous {
            let current = self.load(&layout, name, active, previous)?;
            if current.source_hash == digest {
                obs::emit_deployed(name, current.version, &digest.short(), true);
                return Ok(current);
            }
        }

        // SEQ is bumped before anything else is written so a version number
        // is never handed out twice, even across a crash.
        let version = layout.read_seq()? + 1;
        layout.write_seq(version)?;

        let record = DeploymentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            source_hash: digest,
            language,
            created_at: Utc::now(),
            path: layout.version_dir(version),
            status: DeploymentStatus::Active,
            version,
        };
        commit_version_dir(&layout, artifact, &record)?;

        if let Err(e) = layout.write_pointer(version) {
            let mut failed = record.to_meta();
            failed.status = DeploymentStatus::Failed;
            if let Err(mark_err) = write_meta(&layout, &failed) {
                tracing::warn!(name, version, error = %mark_err, "could not mark version failed");
            }
            return Err(e.into());
        }
        if let Err(e) = sync_dir(layout.dir()) {
            tracing::debug!(name, error = %e, "directory sync failed");
        }
        if let Some(prev) = previous {
            self.store_status(&layout, name, prev, DeploymentStatus::Inactive);
        }

        self.mark_log(name, &format!("deployed v{version} ({})", digest.short()));
        METRICS.inc_deployments();
        obs::emit_deployed(name, version, &digest.short(), false);
        Ok(record)
    }

    /// Reactivate the newest inactive version older than the active one.
    /// The version that was active becomes `RolledBack`.
    pub async fn rollback(&self, name: &str) -> DeployResult<DeploymentRecord> {
        validate_name(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let layout = self.existing(name)?;
        let active = layout
            .read_pointer()?
            .ok_or_else(|| DeployError::NoActiveVersion {
                name: name.to_string(),
            })?;

        let mut target = None;
        for v in layout.versions()?.into_iter().rev().filter(|v| *v < active) {
            if self.stored_meta(&layout, name, v)?.status == DeploymentStatus::Inactive {
                target = Some(v);
                break;
            }
        }
        let target = target.ok_or_else(|| DeployError::NoPriorVersion {
            name: name.to_string(),
        })?;

        // Stored status of a non-pointer version is invisible to readers, so
        // mark first and swap second.
        let mut current = self.stored_meta(&layout, name, active)?;
        current.status = DeploymentStatus::RolledBack;
        write_meta(&layout, &current)?;
        if let Err(e) = layout.write_pointer(target) {
            current.status = DeploymentStatus::Active;
            if let Err(revert_err) = write_meta(&layout, &current) {
                tracing::warn!(name, version = active, error = %revert_err, "could not restore status");
            }
            return Err(e.into());
        }
        self.store_status(&layout, name, target, DeploymentStatus::Active);

        self.mark_log(name, &format!("rolled back v{active} to v{target}"));
        METRICS.inc_rollbacks();
        obs::emit_rolled_back(name, active, target);
        self.load(&layout, name, target, Some(target))
    }

    /// All records for `name`, or for every name, newest first.
    pub fn list(&self, name: Option<&str>) -> DeployResult<Vec<DeploymentRecord>> {
        match name {
            Some(name) => {
                validate_name(name)?;
                self.list_name(name)
            }
            None => {
                let mut all = Vec::new();
                for entry in fs::read_dir(&self.root)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_dir() {
                        continue;
                    }
                    let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if validate_name(&name).is_ok() {
                        all.extend(self.list_name(&name)?);
                    }
                }
                all.sort_by(|a, b| {
                    b.created_at
                        .cmp(&a.created_at)
                        .then_with(|| a.name.cmp(&b.name))
                        .then_with(|| b.version.cmp(&a.version))
                });
                Ok(all)
            }
        }
    }

    fn list_name(&self, name: &str) -> DeployResult<Vec<DeploymentRecord>> {
        let layout = NameLayout::new(&self.root, name);
        let active = layout.read_pointer()?;
        let mut records = Vec::new();
        for v in layout.versions()?.into_iter().rev() {
            match self.load(&layout, name, v, active) {
                Ok(record) => records.push(record),
                // Deleted between the directory scan and the read.
                Err(DeployError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    pub fn get(&self, name: &str, version: u64) -> DeployResult<DeploymentRecord> {
        validate_name(name)?;
        let layout = NameLayout::new(&self.root, name);
        let active = layout.read_pointer()?;
        self.load(&layout, name, version, active)
    }

    /// The active version of `name`, if one is set.
    pub fn active(&self, name: &str) -> DeployResult<Option<DeploymentRecord>> {
        validate_name(name)?;
        let layout = NameLayout::new(&self.root, name);
        match layout.read_pointer()? {
            Some(v) => self.load(&layout, name, v, Some(v)).map(Some),
            None => Ok(None),
        }
    }

    /// Remove one version, or every version of `name` when `version` is
    /// `None`.
    ///
    /// Deleting the active version first activates the newest inactive
    /// version as a substitute; with no substitute the call fails with
    /// [`DeployError::CannotDeleteActive`]. Deleting a whole name requires
    /// that it has no active version (see [`Self::deactivate`]). The version
    /// counter survives so numbers are never reused.
    pub async fn delete(&self, name: &str, version: Option<u64>) -> DeployResult<()> {
        validate_name(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let layout = self.existing(name)?;
        let active = layout.read_pointer()?;

        match version {
            Some(v) => {
                if !layout.version_dir(v).is_dir() {
                    return Err(DeployError::NotFound {
                        name: name.to_string(),
                        version: Some(v),
                    });
                }
                if active == Some(v) {
                    let substitute = self.substitute_for(&layout, name, v)?.ok_or_else(|| {
                        DeployError::CannotDeleteActive {
                            name: name.to_string(),
                            version: v,
                        }
                    })?;
                    layout.write_pointer(substitute)?;
                    self.store_status(&layout, name, substitute, DeploymentStatus::Active);
                    self.mark_log(name, &format!("activated v{substitute} replacing deleted v{v}"));
                    tracing::info!(name, from = v, to = substitute, "activated substitute before delete");
                }
                remove_dir(&layout, &layout.version_dir(v))?;
            }
            None => {
                if let Some(v) = active {
                    return Err(DeployError::CannotDeleteActive {
                        name: name.to_string(),
                        version: v,
                    });
                }
                // SEQ may only exist implicitly as the highest version dir;
                // pin it before those dirs go so numbering continues.
                if !layout.has_seq_file() {
                    let seq = layout.read_seq()?;
                    layout.write_seq(seq)?;
                }
                for v in layout.versions()? {
                    remove_dir(&layout, &layout.version_dir(v))?;
                }
                if layout.logs_dir().is_dir() {
                    remove_dir(&layout, &layout.logs_dir())?;
                }
            }
        }

        obs::emit_deleted(name, version);
        Ok(())
    }

    /// Clear the active pointer of `name`. Returns the version that was
    /// active, now `Inactive`.
    pub async fn deactivate(&self, name: &str) -> DeployResult<Option<DeploymentRecord>> {
        validate_name(name)?;
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let layout = self.existing(name)?;
        let Some(active) = layout.read_pointer()? else {
            return Ok(None);
        };
        layout.clear_pointer()?;
        self.store_status(&layout, name, active, DeploymentStatus::Inactive);
        tracing::info!(name, version = active, "deployment deactivated");
        self.load(&layout, name, active, None).map(Some)
    }

    /// Log file the health monitor scans for `name`.
    pub fn log_path(&self, name: &str) -> PathBuf {
        NameLayout::new(&self.root, name).log_path()
    }

    /// Append `text` to the deployment log of `name`.
    pub fn append_log(&self, name: &str, text: &str) -> DeployResult<()> {
        validate_name(name)?;
        let layout = NameLayout::new(&self.root, name);
        fs::create_dir_all(layout.logs_dir())?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(layout.log_path())?;
        file.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Start a new log section. Failures only cost log-scan precision.
    fn mark_log(&self, name: &str, text: &str) {
        let line = format!("{LOG_SECTION_MARKER} {} {text}", Utc::now().to_rfc3339());
        if let Err(e) = self.append_log(name, &line) {
            tracing::warn!(name, error = %e, "could not write deployment log marker");
        }
    }

    fn existing(&self, name: &str) -> DeployResult<NameLayout> {
        let layout = NameLayout::new(&self.root, name);
        if !layout.exists() {
            return Err(DeployError::NotFound {
                name: name.to_string(),
                version: None,
            });
        }
        Ok(layout)
    }

    fn stored_meta(&self, layout: &NameLayout, name: &str, version: u64) -> DeployResult<VersionMeta> {
        let raw = fs::read(layout.meta_path(version)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DeployError::NotFound {
                    name: name.to_string(),
                    version: Some(version),
                }
            } else {
                DeployError::Io(e)
            }
        })?;
        let meta: VersionMeta = serde_json::from_slice(&raw)?;
        if meta.version != version || meta.name != name {
            return Err(DeployError::CorruptState {
                name: name.to_string(),
                detail: format!(
                    "v{version}/metadata.json describes {} v{}",
                    meta.name, meta.version
                ),
            });
        }
        Ok(meta)
    }

    /// Load a record with its status derived from `active`.
    fn load(
        &self,
        layout: &NameLayout,
        name: &str,
        version: u64,
        active: Option<u64>,
    ) -> DeployResult<DeploymentRecord> {
        let meta = self.stored_meta(layout, name, version)?;
        let mut record = meta.into_record(&layout.version_dir(version));
        record.status = derive_status(record.status, active == Some(version));
        Ok(record)
    }

    /// Best-effort stored status update for a version whose visible status
    /// is already decided by the pointer.
    fn store_status(&self, layout: &NameLayout, name: &str, version: u64, status: DeploymentStatus) {
        let result = self.stored_meta(layout, name, version).and_then(|mut meta| {
            meta.status = status;
            write_meta(layout, &meta)
        });
        if let Err(e) = result {
            tracing::warn!(name, version, %status, error = %e, "could not update stored status");
        }
    }

    fn substitute_for(&self, layout: &NameLayout, name: &str, version: u64) -> DeployResult<Option<u64>> {
        let mut candidates = layout.versions()?;
        candidates.retain(|v| *v != version);
        // Prefer older versions, newest first, then newer ones.
        candidates.sort_by_key(|v| (*v > version, std::cmp::Reverse(*v)));
        for v in candidates {
            if self.stored_meta(layout, name, v)?.status == DeploymentStatus::Inactive {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }
}

fn derive_status(stored: DeploymentStatus, is_pointer_target: bool) -> DeploymentStatus {
    match (is_pointer_target, stored) {
        (true, _) => DeploymentStatus::Active,
        (false, DeploymentStatus::Active) => DeploymentStatus::Inactive,
        (false, other) => other,
    }
}

fn write_meta(layout: &NameLayout, meta: &VersionMeta) -> DeployResult<()> {
    write_atomic(&layout.meta_path(meta.version), &serde_json::to_vec_pretty(meta)?)?;
    Ok(())
}

/// Stage the version directory and rename it into place. On failure the
/// staging directory is removed and no `v<N>` exists.
fn commit_version_dir(
    layout: &NameLayout,
    artifact: &SourceArtifact,
    record: &DeploymentRecord,
) -> DeployResult<()> {
    let staging = layout.staging_dir();
    fs::create_dir(&staging)?;
    let staged = (|| -> DeployResult<()> {
        materialize(artifact, &staging)?;
        write_atomic(
            &staging.join("metadata.json"),
            &serde_json::to_vec_pretty(&record.to_meta())?,
        )?;
        fs::write(staging.join("README.md"), readme(record))?;
        sync_dir(&staging)?;
        fs::rename(&staging, &record.path)?;
        Ok(())
    })();
    if staged.is_err() {
        if let Err(e) = fs::remove_dir_all(&staging) {
            tracing::debug!(path = %staging.display(), error = %e, "staging cleanup failed");
        }
    }
    staged
}

/// Move `dir` aside by rename, then remove it, so readers never see a
/// half-deleted version.
fn remove_dir(layout: &NameLayout, dir: &Path) -> DeployResult<()> {
    let trash = layout.trash_dir();
    fs::rename(dir, &trash)?;
    fs::remove_dir_all(&trash)?;
    Ok(())
}

fn readme(record: &DeploymentRecord) -> String {
    format!(
        "# {name} v{version}\n\n\
         - id: `{id}`\n\
         - language: {language}\n\
         - source hash: `{hash}`\n\
         - created: {created}\n\n\
         Entry file: `{entry}`. This directory is immutable; deploy a new \
         version instead of editing it.\n",
        name = record.name,
        version = record.version,
        id = record.id,
        language = record.language,
        hash = record.source_hash,
        created = record.created_at.to_rfc3339(),
        entry = record.language.entry_file(),
    )
}
