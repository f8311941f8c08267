//! Optional backup module (§6 "Optional Modules": "Preflight-only modules
//! (memory/graph/scheduler/backup)"). Unlike memory/graph/scheduler —
//! which are out of scope beyond the preflight hooks in
//! [`crate::resource_governor`] — backup has an explicit wire format in
//! §6: `backups/backup-<t>/manifest.json` plus copied subtrees. This
//! module is the only optional module that gets real read/write
//! operations; the control plane only wires it in when `[backup].enabled`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::GatewayError;

/// Top-level directories copied verbatim into (and restored from) a
/// backup snapshot. `sessions` carries the durable session store
/// (transcripts, full-logs, index, lock files are skipped since they're
/// re-created on demand); `auth-profiles.json` and `config.toml` live
/// directly under `data_dir`.
const BACKUP_SUBTREES: &[&str] = &["sessions", "subagents"];
const BACKUP_FILES: &[&str] = &["auth-profiles.json", "config.toml"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub subtrees: Vec<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub path: String,
}

/// Copies the workspace's durable state into (and back out of)
/// `<data_dir>/backups/backup-<timestamp>/`, alongside a `manifest.json`
/// recording exactly what was captured.
pub struct BackupManager {
    data_dir: PathBuf,
    backups_dir: PathBuf,
}

impl BackupManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            backups_dir: data_dir.join("backups"),
            data_dir,
        }
    }

    fn backup_dir(&self, id: &str) -> PathBuf {
        self.backups_dir.join(id)
    }

    /// Snapshot the workspace's durable state. Returns the new backup's
    /// id (`backup-<millis>`) and location.
    pub async fn create(&self) -> Result<BackupSummary> {
        let id = format!("backup-{}", Utc::now().timestamp_millis());
        let dest = self.backup_dir(&id);
        tokio::fs::create_dir_all(&dest)
            .await
            .with_context(|| format!("failed to create backup directory {}", dest.display()))?;

        let mut copied_subtrees = Vec::new();
        for subtree in BACKUP_SUBTREES {
            let src = self.data_dir.join(subtree);
            if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
                continue;
            }
            copy_dir_recursive(&src, &dest.join(subtree)).await?;
            copied_subtrees.push(subtree.to_string());
        }

        let mut copied_files = Vec::new();
        for file in BACKUP_FILES {
            let src = self.data_dir.join(file);
            if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
                continue;
            }
            tokio::fs::copy(&src, dest.join(file))
                .await
                .with_context(|| format!("failed to copy {file} into backup"))?;
            copied_files.push(file.to_string());
        }

        let manifest = BackupManifest {
            version: 1,
            id: id.clone(),
            created_at: Utc::now(),
            subtrees: copied_subtrees,
            files: copied_files,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        crate::storage::atomic::write(&dest.join("manifest.json"), &manifest_bytes).await?;

        info!(backup_id = %id, "created backup snapshot");
        Ok(BackupSummary {
            id,
            created_at: manifest.created_at,
            path: dest.display().to_string(),
        })
    }

    /// List available backups, newest first.
    pub async fn list(&self) -> Result<Vec<BackupSummary>> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.backups_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let manifest_path = entry.path().join("manifest.json");
            let Ok(raw) = tokio::fs::read_to_string(&manifest_path).await else {
                continue;
            };
            let Ok(manifest) = serde_json::from_str::<BackupManifest>(&raw) else {
                continue;
            };
            out.push(BackupSummary {
                id: manifest.id,
                created_at: manifest.created_at,
                path: entry.path().display().to_string(),
            });
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Restore a previously created backup over the live workspace state.
    /// Subtrees and files absent from the manifest are left untouched;
    /// this only overwrites what the backup actually captured.
    pub async fn restore(&self, id: &str) -> Result<()> {
        let src = self.backup_dir(id);
        let manifest_path = src.join("manifest.json");
        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|_| GatewayError::NotFound(format!("backup {id}")))?;
        let manifest: BackupManifest =
            serde_json::from_str(&raw).context("corrupt backup manifest")?;

        for subtree in &manifest.subtrees {
            let from = src.join(subtree);
            let to = self.data_dir.join(subtree);
            if tokio::fs::try_exists(&to).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(&to).await.ok();
            }
            copy_dir_recursive(&from, &to).await?;
        }
        for file in &manifest.files {
            let from = src.join(file);
            let to = self.data_dir.join(file);
            tokio::fs::copy(&from, &to)
                .await
                .with_context(|| format!("failed to restore {file} from backup {id}"))?;
        }

        info!(backup_id = %id, "restored backup snapshot");
        Ok(())
    }
}

fn copy_dir_recursive<'a>(
    from: &'a Path,
    to: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(to).await?;
        let mut entries = tokio::fs::read_dir(from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let dest = to.join(entry.file_name());
            if file_type.is_dir() {
                copy_dir_recursive(&entry.path(), &dest).await?;
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &dest).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn seed_workspace(data_dir: &Path) {
        tokio::fs::create_dir_all(data_dir.join("sessions")).await.unwrap();
        tokio::fs::write(data_dir.join("sessions").join("alpha.jsonl"), b"{}\n")
            .await
            .unwrap();
        tokio::fs::write(data_dir.join("auth-profiles.json"), b"{}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_backup_copies_sessions_and_writes_manifest() {
        let dir = TempDir::new().unwrap();
        seed_workspace(dir.path()).await;
        let mgr = BackupManager::new(dir.path().to_path_buf());

        let summary = mgr.create().await.unwrap();
        let manifest_path = PathBuf::from(&summary.path).join("manifest.json");
        assert!(manifest_path.exists());
        let copied = PathBuf::from(&summary.path).join("sessions").join("alpha.jsonl");
        assert!(copied.exists());
    }

    #[tokio::test]
    async fn restore_overwrites_sessions_from_backup() {
        let dir = TempDir::new().unwrap();
        seed_workspace(dir.path()).await;
        let mgr = BackupManager::new(dir.path().to_path_buf());
        let summary = mgr.create().await.unwrap();

        tokio::fs::write(dir.path().join("sessions").join("alpha.jsonl"), b"{\"mutated\":true}\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("sessions").join("beta.jsonl"), b"{}\n")
            .await
            .unwrap();

        mgr.restore(&summary.id).await.unwrap();

        let restored = tokio::fs::read(dir.path().join("sessions").join("alpha.jsonl"))
            .await
            .unwrap();
        assert_eq!(restored, b"{}\n");
        assert!(!dir.path().join("sessions").join("beta.jsonl").exists());
    }

    #[tokio::test]
    async fn list_reports_newest_first() {
        let dir = TempDir::new().unwrap();
        seed_workspace(dir.path()).await;
        let mgr = BackupManager::new(dir.path().to_path_buf());
        let first = mgr.create().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = mgr.create().await.unwrap();

        let list = mgr.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, second.id);
        assert_eq!(list[1].id, first.id);
    }
}
