//! Backup sinks: where snapshots go.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::subsystems::registry::snapshot::Snapshot;

/// External store for the most recent snapshot.
pub trait BackupSink: Send + Sync + 'static {
    /// Replace the stored snapshot.
    fn write(&self, snapshot: &Snapshot) -> Result<(), AppError>;

    /// The stored snapshot, or `None` if nothing was written yet.
    fn read(&self) -> Result<Option<Snapshot>, AppError>;
}

/// Pretty-printed JSON file, replaced atomically. The previous file is kept
/// as a timestamped sibling (`registry_backup.20240101T000000.000000000Z.json`),
/// and only the newest `retain` siblings survive.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
    retain: usize,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>, retain: usize) -> Self {
        Self { path: path.into(), retain }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup".to_string())
    }

    /// Rotated copies, oldest first.
    pub fn rotated(&self) -> Result<Vec<PathBuf>, AppError> {
        let Some(dir) = self.path.parent() else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}.", self.stem());
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AppError::Backup(format!("cannot list {}: {e}", dir.display())));
            }
        };

        let mut copies: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p != &self.path)
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
            })
            .collect();
        copies.sort();
        Ok(copies)
    }

    fn rotate(&self) -> Result<(), AppError> {
        if self.retain > 0 && self.path.exists() {
            let stamp = Utc::now().format("%Y%m%dT%H%M%S%.9fZ");
            let copy = self.path.with_file_name(format!("{}.{stamp}.json", self.stem()));
            fs::copy(&self.path, &copy)
                .map_err(|e| AppError::Backup(format!("cannot copy previous backup: {e}")))?;
            debug!(copy = %copy.display(), "previous backup rotated");
        }

        let copies = self.rotated()?;
        let excess = copies.len().saturating_sub(self.retain);
        for old in &copies[..excess] {
            if let Err(e) = fs::remove_file(old) {
                warn!(path = %old.display(), "cannot remove old backup: {e}");
            }
        }
        Ok(())
    }
}

impl BackupSink for JsonFileSink {
    fn write(&self, snapshot: &Snapshot) -> Result<(), AppError> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| AppError::Backup(format!("cannot create {}: {e}", dir.display())))?;
        }
        self.rotate()?;

        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| AppError::Backup(format!("cannot encode snapshot: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)
            .map_err(|e| AppError::Backup(format!("cannot write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            AppError::Backup(format!("cannot move backup into {}: {e}", self.path.display()))
        })?;
        Ok(())
    }

    fn read(&self) -> Result<Option<Snapshot>, AppError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::Backup(format!("cannot read {}: {e}", self.path.display())));
            }
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| AppError::Backup(format!("invalid snapshot {}: {e}", self.path.display())))
    }
}
