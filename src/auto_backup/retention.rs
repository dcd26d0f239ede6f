use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Datelike, IsoWeek, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::auto_backup::indexer::{self, BackupGroup};
use crate::auto_backup::{BackupError, BackupResult};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Tiered retention settings for one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Most recent backups kept unconditionally
    pub keep_last_n: usize,
    /// One backup per calendar day is kept while younger than this
    pub keep_daily_for: Duration,
    /// One backup per ISO week is kept while younger than this
    pub keep_weekly_for: Duration,
    /// One backup per calendar month is kept while younger than this
    pub keep_monthly_for: Duration,
    /// Period of the background sweep. Zero disables the timer.
    pub cleanup_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_last_n: 10,
            keep_daily_for: DAY * 30,
            keep_weekly_for: DAY * 90,
            keep_monthly_for: DAY * 365,
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Which groups survive a retention pass
#[derive(Debug, Clone, Default)]
pub struct PruneDecision {
    /// Newest first
    pub keep: Vec<BackupGroup>,
    /// Newest first
    pub delete: Vec<BackupGroup>,
}

/// Outcome of a cleanup sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub kept: usize,
    pub deleted_groups: Vec<u32>,
    pub removed_members: usize,
    pub failed_paths: Vec<PathBuf>,
}

#[derive(Default)]
struct TierMarks {
    days: HashSet<NaiveDate>,
    weeks: HashSet<IsoWeek>,
    months: HashSet<(i32, u32)>,
}

/// Split `groups` into keep and delete sets.
///
/// The first `keep_last_n` groups (newest first) are kept. Every other group
/// falls into exactly one age band and is kept only if its band has not
/// already kept a group from the same day, ISO week or month.
pub fn prune(mut groups: Vec<BackupGroup>, policy: &RetentionPolicy, now: DateTime<Utc>) -> PruneDecision {
    groups.sort_by(|a, b| b.mod_time.cmp(&a.mod_time).then_with(|| b.index.cmp(&a.index)));

    let mut marks = TierMarks::default();
    let mut decision = PruneDecision::default();

    for (position, group) in groups.into_iter().enumerate() {
        let keep = if position < policy.keep_last_n {
            true
        } else {
            let age = (now - group.mod_time).to_std().unwrap_or(Duration::ZERO);
            let at = group.mod_time;
            if age < policy.keep_daily_for {
                marks.days.insert(at.date_naive())
            } else if age < policy.keep_weekly_for {
                marks.weeks.insert(at.iso_week())
            } else if age < policy.keep_monthly_for {
                marks.months.insert((at.year(), at.month()))
            } else {
                false
            }
        };

        if keep {
            decision.keep.push(group);
        } else {
            decision.delete.push(group);
        }
    }

    decision
}

/// Remove every member of a group. Returns the members that could not be removed.
pub fn delete_group(group: &BackupGroup) -> Vec<PathBuf> {
    let mut failed = Vec::new();
    for member in &group.members {
        let result = if member.is_dir() {
            fs::remove_dir_all(member)
        } else {
            fs::remove_file(member)
        };
        if let Err(e) = result {
            tracing::warn!(
                index = group.index,
                path = %member.display(),
                error = %e,
                "Failed to delete backup member"
            );
            failed.push(member.clone());
        }
    }
    failed
}

/// Apply `policy` to the store and delete what it rejects.
///
/// Individual delete failures do not stop the sweep. They are collected in
/// the report; [`CleanupReport::into_result`] turns them into `PartialFailure`.
pub fn run_cleanup(store_dir: &Path, policy: &RetentionPolicy, now: DateTime<Utc>) -> BackupResult<CleanupReport> {
    let groups = indexer::list_groups(store_dir)?;
    let decision = prune(groups, policy, now);

    let mut report = CleanupReport {
        kept: decision.keep.len(),
        ..CleanupReport::default()
    };
    for group in &decision.delete {
        let failed = delete_group(group);
        report.removed_members += group.members.len() - failed.len();
        if failed.is_empty() {
            tracing::debug!(index = group.index, "Deleted expired backup");
            report.deleted_groups.push(group.index);
        }
        report.failed_paths.extend(failed);
    }

    Ok(report)
}

impl CleanupReport {
    /// Turn collected delete failures into an error.
    pub fn into_result(self) -> BackupResult<Self> {
        if self.failed_paths.is_empty() {
            Ok(self)
        } else {
            Err(BackupError::PartialFailure {
                action: "deleted",
                failed: self.failed_paths.len(),
                total: self.failed_paths.len() + self.removed_members,
            })
        }
    }
}
