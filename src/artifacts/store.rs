use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use path_clean::PathClean;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{ArtifactKind, ArtifactRecord, STATE_FILES, StorageStats, is_valid_run_id};
use crate::errors::ArtifactError;
use crate::storage::write_atomic;

/// Per-run evidence directories under a single base root.
///
/// Layout: `<base>/<run_id>/{screenshots,videos,logs,reports}/…`
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf().clean(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory of a run. The id is validated before it touches a path.
    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf, ArtifactError> {
        if !is_valid_run_id(run_id) {
            warn!(target: "security", run_id = %run_id, "Rejected malformed run id");
            return Err(ArtifactError::InvalidRunId(run_id.to_string()));
        }
        Ok(self.base_dir.join(run_id))
    }

    /// Create the run root and its fixed subdirectories.
    pub async fn create_run_directory(&self, run_id: &str) -> Result<PathBuf, ArtifactError> {
        let run_dir = self.run_dir(run_id)?;
        for sub in ArtifactKind::SUBDIRS {
            tokio::fs::create_dir_all(run_dir.join(sub)).await?;
        }
        debug!(run_id = %run_id, path = %run_dir.display(), "Created run directory");
        Ok(run_dir)
    }

    /// Resolve `relative` inside the run directory without touching the
    /// filesystem. Anything that lands outside fails closed.
    pub fn resolve(&self, run_id: &str, relative: &str) -> Result<PathBuf, ArtifactError> {
        let run_dir = self.run_dir(run_id)?;
        let requested = Path::new(relative);
        let candidate = run_dir.join(requested).clean();

        if requested.is_absolute() || !candidate.starts_with(&run_dir) || candidate == run_dir {
            warn!(
                target: "security",
                run_id = %run_id,
                requested = %relative,
                "Artifact path escapes run directory"
            );
            return Err(ArtifactError::PathEscape {
                requested: relative.to_string(),
                root: self.base_dir.clone(),
            });
        }
        Ok(candidate)
    }

    /// Resolve and confirm an existing artifact, following symlinks only if
    /// the real location is still under the base root.
    pub async fn get_artifact_path(
        &self,
        run_id: &str,
        relative: &str,
    ) -> Result<PathBuf, ArtifactError> {
        let candidate = self.resolve(run_id, relative)?;

        let real = match tokio::fs::canonicalize(&candidate).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(format!("{}/{}", run_id, relative)));
            }
            Err(e) => return Err(e.into()),
        };
        let real_root = tokio::fs::canonicalize(&self.base_dir).await?;
        if !real.starts_with(&real_root) {
            warn!(
                target: "security",
                run_id = %run_id,
                requested = %relative,
                "Artifact resolves outside base root through a link"
            );
            return Err(ArtifactError::PathEscape {
                requested: relative.to_string(),
                root: self.base_dir.clone(),
            });
        }
        if !real.is_file() {
            return Err(ArtifactError::NotFound(format!("{}/{}", run_id, relative)));
        }
        Ok(candidate)
    }

    pub async fn get_artifact(&self, run_id: &str, relative: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.get_artifact_path(run_id, relative).await?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Store `bytes` under `name`, classified by extension unless `kind` is
    /// given. Returns the path relative to the run directory.
    pub async fn save_artifact(
        &self,
        run_id: &str,
        name: &str,
        bytes: &[u8],
        kind: Option<ArtifactKind>,
    ) -> Result<String, ArtifactError> {
        let file_name = Path::new(name);
        if file_name.file_name().and_then(|n| n.to_str()) != Some(name) {
            warn!(target: "security", run_id = %run_id, name = %name, "Rejected artifact name");
            return Err(ArtifactError::PathEscape {
                requested: name.to_string(),
                root: self.base_dir.clone(),
            });
        }

        let kind = kind.unwrap_or_else(|| ArtifactKind::classify(file_name));
        let relative = match kind.subdir() {
            Some(sub) => format!("{}/{}", sub, name),
            None => name.to_string(),
        };
        let path = self.resolve(run_id, &relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, bytes).await.map_err(into_io)?;

        debug!(run_id = %run_id, artifact = %relative, size = bytes.len(), "Saved artifact");
        Ok(relative)
    }

    /// Serialize `value` as pretty JSON at `relative` (e.g. `report.json`).
    pub async fn save_json<T: Serialize>(
        &self,
        run_id: &str,
        relative: &str,
        value: &T,
    ) -> Result<String, ArtifactError> {
        let path = self.resolve(run_id, relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| ArtifactError::Io(std::io::Error::other(e)))?;
        write_atomic(&path, &data).await.map_err(into_io)?;
        Ok(relative.to_string())
    }

    pub async fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRecord>, ArtifactError> {
        let run_dir = self.run_dir(run_id)?;
        if !tokio::fs::try_exists(&run_dir).await? {
            return Err(ArtifactError::NotFound(format!("run {}", run_id)));
        }
        let owner = run_id.to_string();
        let records = tokio::task::spawn_blocking(move || scan_run_dir(&run_dir, &owner))
            .await
            .map_err(|e| ArtifactError::Io(std::io::Error::other(e)))?;
        Ok(records)
    }

    /// Remove a run directory. Returns false if there was nothing to remove.
    pub async fn delete_run_artifacts(&self, run_id: &str) -> Result<bool, ArtifactError> {
        let run_dir = self.run_dir(run_id)?;
        if !tokio::fs::try_exists(&run_dir).await? {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&run_dir).await?;
        info!(run_id = %run_id, "Deleted run artifacts");
        Ok(true)
    }

    /// Remove run directories older than the retention window and return
    /// the ids removed.
    pub async fn sweep_expired(&self, retention_days: u32) -> anyhow::Result<Vec<String>> {
        if !tokio::fs::try_exists(&self.base_dir).await? {
            return Ok(Vec::new());
        }
        let retention = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
        let now = SystemTime::now();
        let mut removed = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.base_dir)
            .await
            .with_context(|| format!("Failed to read {}", self.base_dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata().await?;
            if !meta.is_dir() || !is_valid_run_id(&name) {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= retention {
                match tokio::fs::remove_dir_all(entry.path()).await {
                    Ok(()) => removed.push(name),
                    Err(e) => warn!(run_id = %name, error = %e, "Failed to remove expired run"),
                }
            }
        }

        info!(retention_days, removed = removed.len(), "Artifact retention sweep finished");
        Ok(removed)
    }

    pub async fn cleanup_old_artifacts(&self, retention_days: u32) -> anyhow::Result<usize> {
        Ok(self.sweep_expired(retention_days).await?.len())
    }

    pub async fn storage_stats(&self) -> anyhow::Result<StorageStats> {
        let base = self.base_dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut stats = StorageStats::default();
            let Ok(entries) = std::fs::read_dir(&base) else {
                return stats;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !entry.path().is_dir() || !is_valid_run_id(&name) {
                    continue;
                }
                stats.runs += 1;
                for record in scan_run_dir(&entry.path(), &name) {
                    stats.files += 1;
                    stats.bytes += record.size;
                    let slot = stats.by_kind.entry(record.kind).or_default();
                    slot.files += 1;
                    slot.bytes += record.size;
                }
            }
            stats
        })
        .await
        .context("storage stats task panicked")
    }
}

fn into_io(err: anyhow::Error) -> ArtifactError {
    ArtifactError::Io(std::io::Error::other(format!("{:#}", err)))
}

fn scan_run_dir(run_dir: &Path, run_id: &str) -> Vec<ArtifactRecord> {
    let mut records: Vec<ArtifactRecord> = WalkDir::new(run_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(run_dir).ok()?;
            let rel = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if STATE_FILES.contains(&rel.as_str()) || rel.ends_with(".tmp") {
                return None;
            }
            let meta = entry.metadata().ok()?;
            let created: DateTime<Utc> = meta
                .created()
                .or_else(|_| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Some(ArtifactRecord {
                run_id: run_id.to_string(),
                name: entry.file_name().to_string_lossy().to_string(),
                kind: ArtifactKind::classify(entry.path()),
                path: rel,
                size: meta.len(),
                created_at: created,
            })
        })
        .collect();
    records.sort_by(|a, b| a.path.cmp(&b.path));
    records
}
