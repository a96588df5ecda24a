//! Bounded, append-only health history per deployment, optionally
//! persisted as one JSONL file per deployment name.
//!
//! Each name has its own async lock; the map of names is only held long
//! enough to look one up. File access runs on the blocking pool.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::entry::HealthCheckEntry;
use super::error::HealthCheckError;
use crate::cas::fs::write_atomic;

#[derive(Debug, Default)]
struct NameLog {
    loaded: bool,
    entries: VecDeque<HealthCheckEntry>,
    /// Lines currently in the JSONL file, so appends never re-read it.
    file_lines: usize,
}

pub struct HealthHistory {
    capacity: usize,
    dir: Option<PathBuf>,
    logs: std::sync::Mutex<HashMap<String, Arc<Mutex<NameLog>>>>,
}

impl HealthHistory {
    /// In-memory history keeping at most `capacity` entries per deployment.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            dir: None,
            logs: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// History persisted under `dir`, loaded lazily per deployment.
    pub fn persistent(capacity: usize, dir: impl Into<PathBuf>) -> Result<Self, HealthCheckError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            capacity: capacity.max(1),
            dir: Some(dir),
            logs: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn file_for(&self, deployment: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{deployment}.jsonl")))
    }

    fn log_for(&self, deployment: &str) -> Arc<Mutex<NameLog>> {
        let mut logs = self
            .logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        logs.entry(deployment.to_string()).or_default().clone()
    }

    /// Lock the log of `deployment`, reading its file on first use.
    async fn open(&self, deployment: &str) -> OwnedMutexGuard<NameLog> {
        let mut log = self.log_for(deployment).lock_owned().await;
        if !log.loaded {
            if let Some(path) = self.file_for(deployment) {
                let capacity = self.capacity;
                match blocking(move || Ok(load(&path, capacity))).await {
                    Ok((entries, file_lines)) => {
                        log.entries = entries;
                        log.file_lines = file_lines;
                    }
                    Err(e) => tracing::warn!(deployment = %deployment, error = %e, "could not load health history"),
                }
            }
            log.loaded = true;
        }
        log
    }

    /// Append `entry`, clamping its timestamp so history never goes
    /// backwards. Returns the entry as stored.
    pub async fn append(&self, mut entry: HealthCheckEntry) -> HealthCheckEntry {
        let mut log = self.open(&entry.deployment).await;

        if let Some(last) = log.entries.back() {
            if entry.timestamp < last.timestamp {
                entry.timestamp = last.timestamp;
            }
        }
        log.entries.push_back(entry.clone());
        while log.entries.len() > self.capacity {
            log.entries.pop_front();
        }

        if let Some(path) = self.file_for(&entry.deployment) {
            // Compact once the file holds twice what memory retains.
            let compact = log.file_lines + 1 >= self.capacity * 2;
            let retained: Option<Vec<HealthCheckEntry>> =
                compact.then(|| log.entries.iter().cloned().collect());
            let line = entry.clone();
            let result = blocking(move || match retained {
                Some(retained) => rewrite(&path, &retained).map(|_| retained.len()),
                None => append_line(&path, &line).map(|_| 0),
            })
            .await;
            match result {
                Ok(kept) if compact => log.file_lines = kept,
                Ok(_) => log.file_lines += 1,
                Err(e) => {
                    tracing::warn!(deployment = %entry.deployment, error = %e, "could not persist health entry")
                }
            }
        }
        entry
    }

    /// All retained entries for `deployment`, oldest first.
    pub async fn entries(&self, deployment: &str) -> Vec<HealthCheckEntry> {
        self.open(deployment).await.entries.iter().cloned().collect()
    }

    /// Entries at or after `since`, oldest first.
    pub async fn since(&self, deployment: &str, since: DateTime<Utc>) -> Vec<HealthCheckEntry> {
        self.open(deployment)
            .await
            .entries
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    pub async fn latest(&self, deployment: &str) -> Option<HealthCheckEntry> {
        self.open(deployment).await.entries.back().cloned()
    }

    /// Keep only the newest `keep` entries, in memory and on disk.
    pub async fn truncate(&self, deployment: &str, keep: usize) -> Result<(), HealthCheckError> {
        let mut log = self.open(deployment).await;
        while log.entries.len() > keep {
            log.entries.pop_front();
        }
        if let Some(path) = self.file_for(deployment) {
            let retained: Vec<_> = log.entries.iter().cloned().collect();
            let kept = retained.len();
            blocking(move || rewrite(&path, &retained)).await?;
            log.file_lines = kept;
        }
        Ok(())
    }

    /// Drop the whole history of `deployment`.
    pub async fn clear(&self, deployment: &str) -> Result<(), HealthCheckError> {
        let mut log = self.log_for(deployment).lock_owned().await;
        log.entries.clear();
        log.file_lines = 0;
        log.loaded = true;
        if let Some(path) = self.file_for(deployment) {
            blocking(move || match fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            })
            .await?;
        }
        Ok(())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, HealthCheckError>
where
    F: FnOnce() -> Result<T, HealthCheckError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HealthCheckError::Io(std::io::Error::other(e)))?
}

/// Read a JSONL history file, keeping the newest `capacity` entries.
/// Unparseable lines are skipped but still counted as file lines.
fn load(path: &Path, capacity: usize) -> (VecDeque<HealthCheckEntry>, usize) {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "could not read health history");
            }
            return (VecDeque::new(), 0);
        }
    };
    let mut log = VecDeque::new();
    let mut lines = 0;
    for (n, line) in raw.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        lines += 1;
        match serde_json::from_str::<HealthCheckEntry>(line) {
            Ok(entry) => {
                log.push_back(entry);
                if log.len() > capacity {
                    log.pop_front();
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), line = n + 1, error = %e, "skipping bad history line"),
        }
    }
    (log, lines)
}

fn append_line(path: &Path, entry: &HealthCheckEntry) -> Result<(), HealthCheckError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    Ok(())
}

fn rewrite(path: &Path, retained: &[HealthCheckEntry]) -> Result<(), HealthCheckError> {
    let mut buf = Vec::new();
    for entry in retained {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }
    write_atomic(path, &buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::entry::{CheckResult, HealthStatus};

    fn entry(name: &str, at: DateTime<Utc>) -> HealthCheckEntry {
        let mut e = HealthCheckEntry::from_checks(name, Some(1), vec![CheckResult::ok("a", "")]);
        e.timestamp = at;
        e
    }

    #[tokio::test]
    async fn test_evicts_oldest() {
        let history = HealthHistory::in_memory(3);
        let now = Utc::now();
        for i in 0..5 {
            history.append(entry("svc", now + chrono::Duration::seconds(i))).await;
        }
        let kept = history.entries("svc").await;
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].timestamp, now + chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn test_timestamps_never_go_backwards() {
        let history = HealthHistory::in_memory(10);
        let now = Utc::now();
        history.append(entry("svc", now)).await;
        let stored = history
            .append(entry("svc", now - chrono::Duration::seconds(30)))
            .await;
        assert_eq!(stored.timestamp, now);
    }

    #[tokio::test]
    async fn test_persisted_history_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let history = HealthHistory::persistent(4, dir.path()).unwrap();
            for i in 0..6 {
                history.append(entry("svc", now + chrono::Duration::seconds(i))).await;
            }
        }
        let reopened = HealthHistory::persistent(4, dir.path()).unwrap();
        let kept = reopened.entries("svc").await;
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[3].timestamp, now + chrono::Duration::seconds(5));
        assert_eq!(kept[3].status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_truncate_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let history = HealthHistory::persistent(10, dir.path()).unwrap();
        let now = Utc::now();
        for i in 0..5 {
            history.append(entry("svc", now + chrono::Duration::seconds(i))).await;
        }
        history.truncate("svc", 2).await.unwrap();
        assert_eq!(history.entries("svc").await.len(), 2);
        let on_disk = fs::read_to_string(dir.path().join("svc.jsonl")).unwrap();
        assert_eq!(on_disk.lines().count(), 2);

        history.clear("svc").await.unwrap();
        assert!(history.entries("svc").await.is_empty());
        assert!(!dir.path().join("svc.jsonl").exists());
    }

    #[tokio::test]
    async fn test_since_filters_window() {
        let history = HealthHistory::in_memory(10);
        let now = Utc::now();
        history.append(entry("svc", now - chrono::Duration::hours(30))).await;
        history.append(entry("svc", now - chrono::Duration::hours(1))).await;
        let recent = history.since("svc", now - chrono::Duration::hours(24)).await;
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn test_names_do_not_share_a_lock() {
        let history = HealthHistory::in_memory(10);
        let _held = history.log_for("busy").lock_owned().await;

        let stored = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            history.append(entry("other", Utc::now())),
        )
        .await
        .expect("append for another name must not wait on a held name");
        assert_eq!(stored.deployment, "other");
        assert_eq!(history.entries("other").await.len(), 1);
    }

    #[tokio::test]
    async fn test_file_is_compacted_without_rereading() {
        let dir = tempfile::tempdir().unwrap();
        let history = HealthHistory::persistent(3, dir.path()).unwrap();
        let now = Utc::now();
        for i in 0..20 {
            history.append(entry("svc", now + chrono::Duration::seconds(i))).await;
            let on_disk = fs::read_to_string(dir.path().join("svc.jsonl")).unwrap();
            assert!(on_disk.lines().count() < 6, "file grew past twice the capacity");
        }
        let reopened = HealthHistory::persistent(3, dir.path()).unwrap();
        let kept = reopened.entries("svc").await;
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[2].timestamp, now + chrono::Duration::seconds(19));
    }
}
