//! Archive codec for backup snapshots
//!
//! Packs a directory tree into a zip, a tar (optionally gzipped) or a plain
//! directory copy, and unpacks any of those back into a directory.
//! - Entries are written in file-name order so identical trees give identical archives
//! - Archives are built under a hidden temp name and renamed into place when complete
//! - Entries that would escape the destination are rejected on unpack

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;
use zip::write::{FileOptions, ZipWriter};
use zip::{CompressionMethod, ZipArchive};

use crate::auto_backup::{BackupError, BackupResult};

/// Prefix for in-progress artifacts. Hidden names are ignored by the indexer.
pub const PARTIAL_PREFIX: &str = ".partial-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    /// Plain copy of the tree
    Directory,
    Zip,
    Tar { gzip: bool },
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Directory => "",
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::Tar { gzip: false } => ".tar",
            ArchiveFormat::Tar { gzip: true } => ".tar.gz",
        }
    }

    /// Splits an archive file name into its stem and format.
    pub fn split_file_name(name: &str) -> Option<(&str, Self)> {
        if let Some(stem) = name.strip_suffix(".tar.gz") {
            return Some((stem, ArchiveFormat::Tar { gzip: true }));
        }
        if let Some(stem) = name.strip_suffix(".tar") {
            return Some((stem, ArchiveFormat::Tar { gzip: false }));
        }
        name.strip_suffix(".zip").map(|stem| (stem, ArchiveFormat::Zip))
    }
}

/// Totals for a packed or unpacked tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub bytes: u64,
}

struct TreeEntry {
    name: String,
    path: PathBuf,
    is_dir: bool,
}

/// Pack `source` into `destination`.
///
/// Anything under one of `excludes` is skipped. `compress` selects deflate for
/// zip entries; tar compression is part of the format.
pub fn pack_directory(
    source: &Path,
    destination: &Path,
    format: ArchiveFormat,
    compress: bool,
    excludes: &[PathBuf],
) -> BackupResult<ArchiveSummary> {
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let entries = collect_entries(source, excludes)?;
    let mut summary = ArchiveSummary::default();

    match format {
        ArchiveFormat::Directory => {
            let staging = tempfile::Builder::new()
                .prefix(PARTIAL_PREFIX)
                .tempdir_in(parent)?;
            for entry in &entries {
                let target = staging.path().join(&entry.name);
                if entry.is_dir {
                    fs::create_dir_all(&target)?;
                } else {
                    if let Some(dir) = target.parent() {
                        fs::create_dir_all(dir)?;
                    }
                    summary.bytes += fs::copy(&entry.path, &target)?;
                    summary.files += 1;
                }
            }
            fs::rename(staging.path(), destination)?;
        }
        ArchiveFormat::Zip => {
            let partial = tempfile::Builder::new()
                .prefix(PARTIAL_PREFIX)
                .tempfile_in(parent)?;
            summary = write_zip(partial.as_file(), &entries, compress)?;
            partial.as_file().sync_all()?;
            partial.persist(destination).map_err(|e| e.error)?;
        }
        ArchiveFormat::Tar { gzip } => {
            let partial = tempfile::Builder::new()
                .prefix(PARTIAL_PREFIX)
                .tempfile_in(parent)?;
            summary = write_tar(partial.as_file(), &entries, gzip)?;
            partial.as_file().sync_all()?;
            partial.persist(destination).map_err(|e| e.error)?;
        }
    }

    Ok(summary)
}

/// Unpack `archive` into `destination`, which is created if missing.
pub fn unpack_archive(
    archive: &Path,
    destination: &Path,
    format: ArchiveFormat,
) -> BackupResult<ArchiveSummary> {
    fs::create_dir_all(destination)?;
    match format {
        ArchiveFormat::Directory => copy_tree(archive, destination),
        ArchiveFormat::Zip => unpack_zip(archive, destination),
        ArchiveFormat::Tar { gzip } => unpack_tar(archive, destination, gzip),
    }
}

fn zip_entry_options(compress: bool) -> FileOptions<'static, ()> {
    let method = if compress {
        CompressionMethod::Deflated
    } else {
        CompressionMethod::Stored
    };
    FileOptions::default().compression_method(method)
}

fn write_zip(file: &File, entries: &[TreeEntry], compress: bool) -> BackupResult<ArchiveSummary> {
    let mut archive = ZipWriter::new(BufWriter::new(file));
    let options = zip_entry_options(compress);
    let mut summary = ArchiveSummary::default();

    for entry in entries {
        if entry.is_dir {
            archive.add_directory(entry.name.as_str(), options)?;
            continue;
        }
        archive.start_file(entry.name.as_str(), options)?;
        let mut source = File::open(&entry.path)?;
        summary.bytes += io::copy(&mut source, &mut archive)?;
        summary.files += 1;
    }

    let mut writer = archive.finish()?;
    writer.flush()?;
    Ok(summary)
}

fn write_tar(file: &File, entries: &[TreeEntry], gzip: bool) -> BackupResult<ArchiveSummary> {
    let writer = BufWriter::new(file);
    let summary = if gzip {
        let encoder = GzEncoder::new(writer, Compression::default());
        let (encoder, summary) = append_tar_entries(encoder, entries)?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        summary
    } else {
        let (mut writer, summary) = append_tar_entries(writer, entries)?;
        writer.flush()?;
        summary
    };
    Ok(summary)
}

fn append_tar_entries<W: Write>(
    writer: W,
    entries: &[TreeEntry],
) -> io::Result<(W, ArchiveSummary)> {
    let mut builder = tar::Builder::new(writer);
    let mut summary = ArchiveSummary::default();

    for entry in entries {
        if entry.is_dir {
            builder.append_dir(&entry.name, &entry.path)?;
        } else {
            builder.append_path_with_name(&entry.path, &entry.name)?;
            summary.files += 1;
            summary.bytes += fs::metadata(&entry.path)?.len();
        }
    }

    Ok((builder.into_inner()?, summary))
}

fn unpack_zip(archive_path: &Path, destination: &Path) -> BackupResult<ArchiveSummary> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    // Reject the whole archive before writing anything
    for name in archive.file_names() {
        if safe_entry_path(name).is_none() {
            return Err(BackupError::UnsafeEntry(name.to_string()));
        }
    }

    let mut summary = ArchiveSummary::default();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let relative =
            safe_entry_path(&name).ok_or_else(|| BackupError::UnsafeEntry(name.clone()))?;
        let target = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut out = File::create(&target)?;
        summary.bytes += io::copy(&mut entry, &mut out)?;
        summary.files += 1;
    }

    Ok(summary)
}

fn unpack_tar(archive_path: &Path, destination: &Path, gzip: bool) -> BackupResult<ArchiveSummary> {
    let file = BufReader::new(File::open(archive_path)?);
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut archive = tar::Archive::new(reader);
    let mut summary = ArchiveSummary::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let relative =
            safe_entry_path(&name).ok_or_else(|| BackupError::UnsafeEntry(name.clone()))?;
        let target = destination.join(relative);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if let Some(dir) = target.parent() {
                    fs::create_dir_all(dir)?;
                }
                summary.bytes += entry.size();
                entry.unpack(&target)?;
                summary.files += 1;
            }
            other => {
                tracing::warn!(entry = %name, kind = ?other, "Skipping unsupported tar entry");
            }
        }
    }

    Ok(summary)
}

/// Copy a directory tree. Used for `copy` mode snapshots.
pub fn copy_tree(source: &Path, destination: &Path) -> BackupResult<ArchiveSummary> {
    let mut summary = ArchiveSummary::default();
    for entry in collect_entries(source, &[])? {
        let target = destination.join(&entry.name);
        if entry.is_dir {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(dir) = target.parent() {
                fs::create_dir_all(dir)?;
            }
            summary.bytes += fs::copy(&entry.path, &target)?;
            summary.files += 1;
        }
    }
    Ok(summary)
}

fn collect_entries(source: &Path, excludes: &[PathBuf]) -> BackupResult<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !excludes.iter().any(|x| e.path().starts_with(x)));

    for entry in walker {
        let entry = entry?;
        let file_type = entry.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            tracing::debug!(path = %entry.path().display(), "Skipping non-regular entry");
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        entries.push(TreeEntry {
            name,
            path: entry.path().to_path_buf(),
            is_dir: file_type.is_dir(),
        });
    }

    Ok(entries)
}

/// Map an archive entry name to a relative path, or `None` if it could escape
/// the extraction root (absolute paths, `..`, drive prefixes).
pub fn safe_entry_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return None;
    }

    let mut out = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            p if p.contains(':') => return None,
            p => out.push(p),
        }
    }
    Some(out)
}
