use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::auto_backup::archive::{self, ArchiveFormat};
use crate::auto_backup::indexer::{self, BackupGroup, BackupLayout};
use crate::auto_backup::{BackupConfig, BackupError, BackupResult};

/// How a snapshot of the content directory is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Copy,
    Tar,
    Zip,
}

impl CaptureMode {
    pub fn archive_format(self, compress: bool) -> ArchiveFormat {
        match self {
            CaptureMode::Copy => ArchiveFormat::Directory,
            CaptureMode::Tar => ArchiveFormat::Tar { gzip: compress },
            CaptureMode::Zip => ArchiveFormat::Zip,
        }
    }
}

impl FromStr for CaptureMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(CaptureMode::Copy),
            "tar" => Ok(CaptureMode::Tar),
            "zip" => Ok(CaptureMode::Zip),
            other => Err(BackupError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureMode::Copy => "copy",
            CaptureMode::Tar => "tar",
            CaptureMode::Zip => "zip",
        };
        f.write_str(name)
    }
}

pub fn snapshot_file_name(index: u32, format: ArchiveFormat) -> String {
    format!("backup({}){}", index, format.extension())
}

/// Archive the content directory into the store under the next free index.
///
/// Must be called with the manager's operation lock held. Returns `None` when
/// the content directory holds no files.
pub fn capture_snapshot(config: &BackupConfig, mode: CaptureMode) -> BackupResult<Option<BackupGroup>> {
    fs::create_dir_all(&config.store_dir).map_err(|source| BackupError::Setup {
        path: config.store_dir.clone(),
        source,
    })?;

    let excludes = nested_store(config)?;
    if !has_content(&config.content_dir, &excludes)? {
        tracing::info!(content = %config.content_dir.display(), "Content directory is empty, skipping capture");
        return Ok(None);
    }

    let groups = indexer::list_groups(&config.store_dir)?;
    let index = indexer::next_index(&groups)?;
    let format = mode.archive_format(config.compress);
    let destination = config.store_dir.join(snapshot_file_name(index, format));

    let summary = archive::pack_directory(
        &config.content_dir,
        &destination,
        format,
        config.compress,
        &excludes,
    )?;
    let mod_time = DateTime::<Utc>::from(fs::metadata(&destination)?.modified()?);

    tracing::info!(
        index,
        mode = %mode,
        files = summary.files,
        bytes = summary.bytes,
        path = %destination.display(),
        "Captured backup"
    );

    Ok(Some(BackupGroup {
        index,
        layout: BackupLayout::Snapshot { format },
        members: vec![destination],
        mod_time,
        synthetic_index: false,
    }))
}

/// The store path as seen from the content directory, if the store lives inside it.
fn nested_store(config: &BackupConfig) -> BackupResult<Vec<PathBuf>> {
    let content = fs::canonicalize(&config.content_dir)?;
    let store = fs::canonicalize(&config.store_dir)?;
    match store.strip_prefix(&content) {
        Ok(relative) if relative.as_os_str().is_empty() => Err(BackupError::Configuration(
            "store directory must differ from the content directory".to_string(),
        )),
        Ok(relative) => Ok(vec![config.content_dir.join(relative)]),
        Err(_) => Ok(Vec::new()),
    }
}

fn has_content(content_dir: &Path, excludes: &[PathBuf]) -> BackupResult<bool> {
    let walker = WalkDir::new(content_dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !excludes.iter().any(|x| e.path().starts_with(x)));
    for entry in walker {
        if entry?.file_type().is_file() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(temp: &TempDir) -> BackupConfig {
        let content = temp.path().join("saves").join("Mars");
        fs::create_dir_all(&content).unwrap();
        BackupConfig::new("Mars", &content, content.join("Safebackups"))
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("zip".parse::<CaptureMode>().unwrap(), CaptureMode::Zip);
        assert_eq!("copy".parse::<CaptureMode>().unwrap(), CaptureMode::Copy);
        assert!(matches!(
            "rar".parse::<CaptureMode>(),
            Err(BackupError::InvalidMode(mode)) if mode == "rar"
        ));
        assert_eq!(CaptureMode::Tar.to_string(), "tar");
    }

    #[test]
    fn test_snapshot_file_names() {
        assert_eq!(snapshot_file_name(3, CaptureMode::Zip.archive_format(true)), "backup(3).zip");
        assert_eq!(snapshot_file_name(4, CaptureMode::Tar.archive_format(true)), "backup(4).tar.gz");
        assert_eq!(snapshot_file_name(5, CaptureMode::Tar.archive_format(false)), "backup(5).tar");
        assert_eq!(snapshot_file_name(6, CaptureMode::Copy.archive_format(true)), "backup(6)");
    }

    #[test]
    fn test_empty_content_is_not_captured() {
        let temp = TempDir::new().unwrap();
        let config = config_in(&temp);
        assert!(capture_snapshot(&config, CaptureMode::Zip).unwrap().is_none());
        assert!(indexer::list_groups(&config.store_dir).unwrap().is_empty());
    }

    #[test]
    fn test_captures_take_increasing_indices() {
        let temp = TempDir::new().unwrap();
        let config = config_in(&temp);
        fs::write(config.content_dir.join("Mars.save"), b"head").unwrap();

        let first = capture_snapshot(&config, CaptureMode::Zip).unwrap().unwrap();
        let second = capture_snapshot(&config, CaptureMode::Tar).unwrap().unwrap();
        let third = capture_snapshot(&config, CaptureMode::Copy).unwrap().unwrap();
        assert_eq!((first.index, second.index, third.index), (1, 2, 3));
        assert!(config.store_dir.join("backup(2).tar.gz").is_file());
        assert!(config.store_dir.join("backup(3)").join("Mars.save").is_file());
        // The nested store is never copied into a snapshot
        assert!(!config.store_dir.join("backup(3)").join("Safebackups").exists());

        let indices: Vec<u32> = indexer::list_groups(&config.store_dir)
            .unwrap()
            .iter()
            .map(|g| g.index)
            .collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn test_capture_keeps_unindexed_save_numbering() {
        let temp = TempDir::new().unwrap();
        let config = config_in(&temp);
        fs::write(config.content_dir.join("Mars.save"), b"head").unwrap();
        capture_snapshot(&config, CaptureMode::Zip).unwrap();
        fs::write(config.store_dir.join("autosave.save"), b"autosave").unwrap();

        let listed = |config: &BackupConfig| -> Vec<(u32, String)> {
            indexer::list_groups(&config.store_dir)
                .unwrap()
                .iter()
                .map(|g| (g.index, g.primary().file_name().unwrap().to_string_lossy().into_owned()))
                .collect()
        };
        assert_eq!(listed(&config)[1], (2, "autosave.save".to_string()));

        let captured = capture_snapshot(&config, CaptureMode::Zip).unwrap().unwrap();
        assert_eq!(captured.index, 3);
        assert_eq!(
            listed(&config),
            vec![
                (1, "backup(1).zip".to_string()),
                (2, "autosave.save".to_string()),
                (3, "backup(3).zip".to_string()),
            ]
        );
    }

    #[test]
    fn test_capture_refused_when_indices_run_out() {
        let temp = TempDir::new().unwrap();
        let config = config_in(&temp);
        fs::write(config.content_dir.join("Mars.save"), b"head").unwrap();
        fs::create_dir_all(&config.store_dir).unwrap();
        fs::write(config.store_dir.join("autosave(4294967295).save"), b"autosave").unwrap();

        assert!(matches!(
            capture_snapshot(&config, CaptureMode::Zip),
            Err(BackupError::IndexExhausted(u32::MAX))
        ));
        assert_eq!(indexer::list_groups(&config.store_dir).unwrap().len(), 1);
    }

    #[test]
    fn test_store_equal_to_content_rejected() {
        let temp = TempDir::new().unwrap();
        let content = temp.path().join("Mars");
        fs::create_dir_all(&content).unwrap();
        fs::write(content.join("Mars.save"), b"head").unwrap();
        let config = BackupConfig::new("Mars", &content, &content);
        assert!(matches!(
            capture_snapshot(&config, CaptureMode::Zip),
            Err(BackupError::Configuration(_))
        ));
    }
}
