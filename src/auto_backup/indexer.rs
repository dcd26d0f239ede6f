use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::auto_backup::archive::ArchiveFormat;
use crate::auto_backup::{BackupError, BackupResult};

static LEGACY_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(world|world_meta)\((\d+)\)(_AutoSave)?\.(xml|bin)$").unwrap()
});
static INDEX_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((\d+)\)").unwrap());
static SNAPSHOT_STEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^backup\((\d+)\)$").unwrap());

/// Member roles of the legacy three-file save layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyRole {
    /// `world(<n>).bin`
    State,
    /// `world(<n>).xml`
    Structure,
    /// `world_meta(<n>).xml`
    Metadata,
}

impl LegacyRole {
    pub const ALL: [LegacyRole; 3] = [LegacyRole::Metadata, LegacyRole::Structure, LegacyRole::State];

    /// Name of the file inside the live directory
    pub fn live_name(self) -> &'static str {
        match self {
            LegacyRole::State => "world.bin",
            LegacyRole::Structure => "world.xml",
            LegacyRole::Metadata => "world_meta.xml",
        }
    }

    /// Stored names for `index`, canonical first, `_AutoSave` variant second.
    pub fn stored_names(self, index: u32) -> [String; 2] {
        let (stem, ext) = match self {
            LegacyRole::State => ("world", "bin"),
            LegacyRole::Structure => ("world", "xml"),
            LegacyRole::Metadata => ("world_meta", "xml"),
        };
        [
            format!("{}({}).{}", stem, index, ext),
            format!("{}({})_AutoSave.{}", stem, index, ext),
        ]
    }

    fn slot(self) -> usize {
        match self {
            LegacyRole::State => 0,
            LegacyRole::Structure => 1,
            LegacyRole::Metadata => 2,
        }
    }
}

/// What a single store entry name means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifiedName {
    Legacy { role: LegacyRole, index: u32 },
    HeadSave { index: Option<u32> },
    Snapshot { index: u32, format: ArchiveFormat },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupLayout {
    /// Three loose files: state, structure and metadata
    Legacy,
    /// One self-contained `.save` archive as written by the game
    HeadSave,
    /// Archive of the whole content directory captured by this engine
    Snapshot { format: ArchiveFormat },
}

/// One logical point-in-time backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupGroup {
    pub index: u32,
    pub layout: BackupLayout,
    /// Member paths, sorted by file name. Never empty.
    pub members: Vec<PathBuf>,
    /// Modification time of the newest member
    pub mod_time: DateTime<Utc>,
    /// Index was derived from modification time rank, not the file name
    pub synthetic_index: bool,
}

impl BackupGroup {
    pub fn primary(&self) -> &Path {
        &self.members[0]
    }

    /// Member for a legacy role, preferring the canonical name over `_AutoSave`.
    pub fn legacy_member(&self, role: LegacyRole) -> Option<&Path> {
        role.stored_names(self.index).iter().find_map(|wanted| {
            self.members
                .iter()
                .find(|m| m.file_name().map_or(false, |n| n == wanted.as_str()))
                .map(|m| m.as_path())
        })
    }
}

/// A raw entry of the store directory
#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub mod_time: DateTime<Utc>,
}

/// Classify a store entry by name alone.
pub fn classify_backup_name(name: &str, is_dir: bool) -> Option<ClassifiedName> {
    if name.starts_with('.') {
        return None;
    }

    if is_dir {
        return snapshot_index(name).map(|index| ClassifiedName::Snapshot {
            index,
            format: ArchiveFormat::Directory,
        });
    }

    if name.ends_with(".save") {
        let index = INDEX_TOKEN
            .captures(name)
            .and_then(|caps| caps[1].parse::<u32>().ok());
        return Some(ClassifiedName::HeadSave { index });
    }

    if let Some(caps) = LEGACY_NAME.captures(name) {
        let index = caps[2].parse::<u32>().ok()?;
        let role = match (&caps[1], &caps[4]) {
            ("world", "bin") => LegacyRole::State,
            ("world", "xml") => LegacyRole::Structure,
            ("world_meta", "xml") => LegacyRole::Metadata,
            _ => return None,
        };
        return Some(ClassifiedName::Legacy { role, index });
    }

    let (stem, format) = ArchiveFormat::split_file_name(name)?;
    snapshot_index(stem).map(|index| ClassifiedName::Snapshot { index, format })
}

fn snapshot_index(stem: &str) -> Option<u32> {
    SNAPSHOT_STEM
        .captures(stem)
        .and_then(|caps| caps[1].parse::<u32>().ok())
}

#[derive(Default)]
struct LegacyParts {
    members: Vec<PathBuf>,
    roles: [bool; 3],
    mod_time: Option<DateTime<Utc>>,
}

/// Build groups from raw entries. Only complete groups are returned, sorted by
/// ascending index.
pub fn group_entries(mut entries: Vec<StoreEntry>) -> Vec<BackupGroup> {
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut legacy: BTreeMap<u32, LegacyParts> = BTreeMap::new();
    let mut explicit: Vec<BackupGroup> = Vec::new();
    let mut unindexed: Vec<StoreEntry> = Vec::new();

    for entry in entries {
        match classify_backup_name(&entry.name, entry.is_dir) {
            Some(ClassifiedName::Legacy { role, index }) => {
                let parts = legacy.entry(index).or_default();
                parts.roles[role.slot()] = true;
                parts.mod_time = Some(parts.mod_time.map_or(entry.mod_time, |t| t.max(entry.mod_time)));
                parts.members.push(entry.path);
            }
            Some(ClassifiedName::HeadSave { index: Some(index) }) => {
                explicit.push(single_group(index, BackupLayout::HeadSave, entry, false));
            }
            Some(ClassifiedName::HeadSave { index: None }) => unindexed.push(entry),
            Some(ClassifiedName::Snapshot { index, format }) => {
                explicit.push(single_group(index, BackupLayout::Snapshot { format }, entry, false));
            }
            None => {}
        }
    }

    for (index, parts) in legacy {
        match parts.mod_time {
            Some(mod_time) if parts.roles.iter().all(|present| *present) => {
                explicit.push(BackupGroup {
                    index,
                    layout: BackupLayout::Legacy,
                    members: parts.members,
                    mod_time,
                    synthetic_index: false,
                });
            }
            _ => tracing::debug!(index, "Ignoring incomplete legacy backup group"),
        }
    }

    // Same index claimed by two layouts: the newer group wins
    explicit.sort_by(|a, b| {
        a.index
            .cmp(&b.index)
            .then_with(|| b.mod_time.cmp(&a.mod_time))
            .then_with(|| a.members.cmp(&b.members))
    });
    let mut groups: Vec<BackupGroup> = Vec::with_capacity(explicit.len() + unindexed.len());
    for group in explicit {
        if groups.last().map(|last| last.index) == Some(group.index) {
            tracing::warn!(
                index = group.index,
                path = %group.primary().display(),
                "Skipping backup whose index is already taken by a newer group"
            );
            continue;
        }
        groups.push(group);
    }

    // Unindexed saves fill the lowest indices no explicit group holds, oldest
    // first. New captures land above the maximum and never shift them.
    let taken: BTreeSet<u32> = groups.iter().map(|g| g.index).collect();
    let mut free = (1..=u32::MAX).filter(|index| !taken.contains(index));
    unindexed.sort_by(|a, b| a.mod_time.cmp(&b.mod_time).then_with(|| b.name.cmp(&a.name)));
    for entry in unindexed {
        match free.next() {
            Some(index) => groups.push(single_group(index, BackupLayout::HeadSave, entry, true)),
            None => tracing::warn!(entry = %entry.name, "No free index left for unindexed save"),
        }
    }

    groups.sort_by_key(|g| g.index);
    groups
}

fn single_group(index: u32, layout: BackupLayout, entry: StoreEntry, synthetic: bool) -> BackupGroup {
    BackupGroup {
        index,
        layout,
        members: vec![entry.path],
        mod_time: entry.mod_time,
        synthetic_index: synthetic,
    }
}

/// Read the store and return its complete backup groups.
pub fn list_groups(store_dir: &Path) -> BackupResult<Vec<BackupGroup>> {
    let read_dir = match fs::read_dir(store_dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BackupError::StoreUnavailable {
                path: store_dir.to_path_buf(),
                source: e,
            })
        }
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        // Entries can vanish between listing and stat
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::debug!(entry = %name, error = %e, "Skipping unreadable store entry");
                continue;
            }
        };
        entries.push(StoreEntry {
            name,
            path: entry.path(),
            is_dir: metadata.is_dir(),
            mod_time: DateTime::<Utc>::from(metadata.modified()?),
        });
    }

    Ok(group_entries(entries))
}

/// Next free index: one past the highest existing index, synthetic ones
/// included.
pub fn next_index(groups: &[BackupGroup]) -> BackupResult<u32> {
    match groups.iter().map(|g| g.index).max() {
        None => Ok(1),
        Some(max) => max.checked_add(1).ok_or(BackupError::IndexExhausted(max)),
    }
}
