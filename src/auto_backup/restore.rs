//! Restores a backup group into the live content directory
//!
//! Every write into the live directory goes through a [`RestoreJournal`] so a
//! failed restore can put the directory back the way it was.

use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use serde::Serialize;
use walkdir::WalkDir;

use crate::auto_backup::archive::{self, ArchiveFormat};
use crate::auto_backup::capture;
use crate::auto_backup::indexer::{self, BackupGroup, BackupLayout, LegacyRole};
use crate::auto_backup::{BackupConfig, BackupError, BackupResult};

const SCRATCH_PREFIX: &str = ".restore-";

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub index: u32,
    pub layout: BackupLayout,
    pub files_written: usize,
    /// Index of the safety capture taken before restoring, if any
    pub pre_backup: Option<u32>,
    /// Live head saves moved into the store
    pub relocated: Vec<PathBuf>,
}

/// Write group `index` into the live directory.
///
/// Must be called with the manager's operation lock held.
pub fn restore_group(config: &BackupConfig, index: u32, skip_pre_backup: bool) -> BackupResult<RestoreReport> {
    let group = indexer::list_groups(&config.store_dir)?
        .into_iter()
        .find(|g| g.index == index)
        .ok_or(BackupError::NotFound(index))?;

    let pre_backup = if skip_pre_backup {
        None
    } else {
        capture::capture_snapshot(config, config.capture_mode)?.map(|g| g.index)
    };

    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(&config.store_dir)?;
    let staged = scratch.path().join("staged");
    let mut journal = RestoreJournal::new(scratch.path().join("journal"))?;

    let mut report = RestoreReport {
        index,
        layout: group.layout,
        files_written: 0,
        pre_backup,
        relocated: Vec::new(),
    };

    let applied = match group.layout {
        BackupLayout::HeadSave => restore_head_save(config, &group, &staged, &mut journal, &mut report),
        BackupLayout::Snapshot { format } => {
            restore_snapshot(config, &group, format, &staged, &mut journal, &mut report)
        }
        BackupLayout::Legacy => restore_legacy(config, &group, &mut journal, &mut report),
    };

    if let Err(e) = applied {
        tracing::error!(index, error = %e, "Restore failed, reverting live directory");
        let failures = journal.revert();
        if failures > 0 {
            tracing::error!(index, failures, "Live directory could not be fully reverted");
        }
        return Err(e);
    }

    tracing::info!(
        index,
        layout = ?report.layout,
        files = report.files_written,
        "Restored backup"
    );
    Ok(report)
}

fn restore_head_save(
    config: &BackupConfig,
    group: &BackupGroup,
    staged: &Path,
    journal: &mut RestoreJournal,
    report: &mut RestoreReport,
) -> BackupResult<()> {
    archive::unpack_archive(group.primary(), staged, ArchiveFormat::Zip)?;
    normalize_timestamps(staged, SystemTime::now())?;

    // Move every live head save aside so the game only sees the restored one
    let mut next = Some(indexer::next_index(&indexer::list_groups(&config.store_dir)?)?);
    let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
    let mut live_saves: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(&config.content_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".save") && entry.file_type()?.is_file() {
            live_saves.push(entry.path());
        }
    }
    live_saves.sort();
    for live in live_saves {
        let name = live
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let index = next.ok_or(BackupError::IndexExhausted(u32::MAX))?;
        let target = config
            .store_dir
            .join(format!("previous_head({})_{}_{}", index, stamp, name));
        journal.relocate(&live, &target)?;
        next = index.checked_add(1);
        report.relocated.push(target);
    }

    let head = config.content_dir.join(format!("{}.save", config.world_name));
    journal.before_write(&head)?;
    archive::pack_directory(staged, &head, ArchiveFormat::Zip, config.compress, &[])?;
    report.files_written = 1;
    Ok(())
}

fn restore_snapshot(
    config: &BackupConfig,
    group: &BackupGroup,
    format: ArchiveFormat,
    staged: &Path,
    journal: &mut RestoreJournal,
    report: &mut RestoreReport,
) -> BackupResult<()> {
    archive::unpack_archive(group.primary(), staged, format)?;
    normalize_timestamps(staged, SystemTime::now())?;

    for entry in WalkDir::new(staged).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(staged)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = config.content_dir.join(relative);

        if entry.file_type().is_dir() {
            journal.create_dir(&target)?;
        } else {
            journal.before_write(&target)?;
            fs::copy(entry.path(), &target)?;
            report.files_written += 1;
        }
    }
    Ok(())
}

fn restore_legacy(
    config: &BackupConfig,
    group: &BackupGroup,
    journal: &mut RestoreJournal,
    report: &mut RestoreReport,
) -> BackupResult<()> {
    let now = SystemTime::now();
    for role in LegacyRole::ALL {
        let source = group
            .legacy_member(role)
            .ok_or(BackupError::NotFound(group.index))?;
        let target = config.content_dir.join(role.live_name());
        journal.before_write(&target)?;
        fs::copy(source, &target)?;
        set_file_times(&target, now)?;
        report.files_written += 1;
    }
    Ok(())
}

/// Set access and modification time of every file under `root` to `now`.
pub fn normalize_timestamps(root: &Path, now: SystemTime) -> BackupResult<usize> {
    let mut touched = 0;
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            set_file_times(entry.path(), now)?;
            touched += 1;
        }
    }
    Ok(touched)
}

fn set_file_times(path: &Path, now: SystemTime) -> io::Result<()> {
    let file = File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_accessed(now).set_modified(now))
}

/// Rename, falling back to copy and remove across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

fn conflict(path: &Path, what: &str) -> BackupError {
    BackupError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{} already exists as {}", path.display(), what),
    ))
}

#[derive(Debug)]
enum JournalEntry {
    CreatedFile(PathBuf),
    CreatedDir(PathBuf),
    Overwritten { target: PathBuf, saved: PathBuf },
    Relocated { from: PathBuf, to: PathBuf },
}

/// Undo log for the live directory
#[derive(Debug)]
pub struct RestoreJournal {
    saved_dir: PathBuf,
    entries: Vec<JournalEntry>,
}

impl RestoreJournal {
    pub fn new(saved_dir: PathBuf) -> BackupResult<Self> {
        fs::create_dir_all(&saved_dir)?;
        Ok(Self {
            saved_dir,
            entries: Vec::new(),
        })
    }

    /// Record `target` before it is written, saving its current content.
    pub fn before_write(&mut self, target: &Path) -> BackupResult<()> {
        match fs::symlink_metadata(target) {
            Ok(metadata) if metadata.is_dir() => Err(conflict(target, "a directory")),
            Ok(_) => {
                let saved = self.saved_dir.join(self.entries.len().to_string());
                fs::copy(target, &saved)?;
                self.entries.push(JournalEntry::Overwritten {
                    target: target.to_path_buf(),
                    saved,
                });
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.entries.push(JournalEntry::CreatedFile(target.to_path_buf()));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create `dir` unless it already exists as a directory.
    pub fn create_dir(&mut self, dir: &Path) -> BackupResult<()> {
        match fs::symlink_metadata(dir) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(conflict(dir, "a file")),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(dir)?;
                self.entries.push(JournalEntry::CreatedDir(dir.to_path_buf()));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn relocate(&mut self, from: &Path, to: &Path) -> BackupResult<()> {
        move_file(from, to)?;
        self.entries.push(JournalEntry::Relocated {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        });
        Ok(())
    }

    /// Undo every recorded change, newest first. Returns the number of
    /// changes that could not be undone.
    pub fn revert(self) -> usize {
        let mut failures = 0;
        for entry in self.entries.into_iter().rev() {
            let (path, result) = match &entry {
                JournalEntry::CreatedFile(path) => (path, ignore_missing(fs::remove_file(path))),
                JournalEntry::CreatedDir(path) => (path, ignore_missing(fs::remove_dir(path))),
                JournalEntry::Overwritten { target, saved } => {
                    (target, fs::copy(saved, target).map(|_| ()))
                }
                JournalEntry::Relocated { from, to } => (from, move_file(to, from)),
            };
            if let Err(e) = result {
                tracing::warn!(path = %path.display(), error = %e, "Failed to revert restore step");
                failures += 1;
            }
        }
        failures
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
