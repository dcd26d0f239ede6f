use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::WalkDir;

use crate::auto_backup::indexer::{BackupGroup, BackupLayout};
use crate::auto_backup::restore::RestoreReport;
use crate::auto_backup::{BackupManager, BackupRegistry, ManagerState};
use crate::commands::CommandFailure;

/// One backup group as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub index: u32,
    pub layout: BackupLayout,
    pub created: DateTime<Utc>,
    pub files: Vec<String>,
    pub size_bytes: u64,
}

impl From<&BackupGroup> for BackupSummary {
    fn from(group: &BackupGroup) -> Self {
        Self {
            index: group.index,
            layout: group.layout,
            created: group.mod_time,
            files: group
                .members
                .iter()
                .filter_map(|m| m.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect(),
            size_bytes: group.members.iter().map(|m| disk_usage(m)).sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub state: ManagerState,
    pub running: bool,
    pub world_name: String,
    pub content_dir: String,
    pub store_dir: String,
}

fn disk_usage(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

fn current(registry: &BackupRegistry) -> Result<BackupManager, CommandFailure> {
    registry.current().ok_or_else(CommandFailure::no_manager)
}

pub async fn list_backups(registry: &BackupRegistry, limit: i64) -> Result<Vec<BackupSummary>, CommandFailure> {
    let groups = current(registry)?.list_backups(limit).await?;
    Ok(groups.iter().map(BackupSummary::from).collect())
}

/// Returns `None` when there was nothing to capture.
pub async fn create_backup(registry: &BackupRegistry, mode: &str) -> Result<Option<BackupSummary>, CommandFailure> {
    let group = current(registry)?.create_backup(mode).await?;
    Ok(group.as_ref().map(BackupSummary::from))
}

pub async fn restore_backup(
    registry: &BackupRegistry,
    index: i64,
    skip_pre_backup: bool,
) -> Result<RestoreReport, CommandFailure> {
    let manager = current(registry)?;
    manager
        .restore_backup(index, skip_pre_backup)
        .await
        .map_err(|e| {
            tracing::error!(index, error = %e, "Restore request failed");
            CommandFailure::from(e)
        })
}

pub fn backup_status(registry: &BackupRegistry) -> Result<BackupStatus, CommandFailure> {
    let manager = current(registry)?;
    let config = manager.config();
    Ok(BackupStatus {
        state: manager.state(),
        running: manager.is_running(),
        world_name: config.world_name.clone(),
        content_dir: config.content_dir.display().to_string(),
        store_dir: config.store_dir.display().to_string(),
    })
}
