// Integration tests for the backup manager lifecycle

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use backup_steward_lib::auto_backup::{
    BackupConfig, BackupError, BackupManager, BackupRegistry, ManagerState, RetentionPolicy,
};
use tempfile::TempDir;
use tokio::task::JoinSet;

/// Content directory with one save file and a nested store
fn test_config(temp: &TempDir) -> BackupConfig {
    let content = temp.path().join("saves").join("Mars");
    fs::create_dir_all(&content).unwrap();
    fs::write(content.join("Mars.save"), b"head save").unwrap();
    BackupConfig::new("Mars", &content, content.join("Safebackups"))
        .with_identifier("lifecycle-test")
        .with_init_timing(Duration::from_millis(10), Duration::from_secs(5))
        .with_cleanup_enabled(false)
}

async fn wait_for_backups(manager: &BackupManager, count: usize) -> bool {
    for _ in 0..200 {
        if manager.list_backups(0).await.map(|g| g.len()).unwrap_or(0) >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn store_names(store: &Path) -> Vec<String> {
    fs::read_dir(store)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_initialize_times_out_when_content_never_appears() {
    let temp = TempDir::new().unwrap();
    let content = temp.path().join("never");
    let config = BackupConfig::new("Mars", &content, content.join("Safebackups"))
        .with_init_timing(Duration::from_millis(10), Duration::from_millis(100));
    let manager = BackupManager::new(config);

    let result = manager.start("timeout-test").await;
    assert!(matches!(result, Err(BackupError::Timeout { .. })));
    assert_eq!(manager.state(), ManagerState::Failed);
    assert!(!manager.is_running());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_initialize_waits_for_content_directory() {
    let temp = TempDir::new().unwrap();
    let content = temp.path().join("late");
    let config = BackupConfig::new("Mars", &content, content.join("Safebackups"))
        .with_init_timing(Duration::from_millis(10), Duration::from_secs(5));
    let manager = BackupManager::new(config);

    let init = manager.initialize("late-test");
    let creator = content.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::create_dir_all(creator).unwrap();
    });

    init.await.unwrap().unwrap();
    assert!(content.join("Safebackups").is_dir());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_initialization() {
    let temp = TempDir::new().unwrap();
    let content = temp.path().join("missing");
    let config = BackupConfig::new("Mars", &content, content.join("Safebackups"))
        .with_init_timing(Duration::from_millis(10), Duration::from_secs(600));
    let manager = BackupManager::new(config);

    let init = manager.initialize("cancel-test");
    tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .unwrap();
    assert!(matches!(init.await.unwrap(), Err(BackupError::Cancelled)));
}

#[tokio::test]
async fn test_new_file_triggers_capture() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp).with_debounce_wait(Duration::from_millis(50));
    let content = config.content_dir.clone();
    let manager = BackupManager::new(config);
    manager.start("capture-test").await.unwrap();
    assert!(manager.is_running());

    fs::write(content.join("autosave_1.save"), b"autosave").unwrap();
    assert!(wait_for_backups(&manager, 1).await, "no capture after a new file");

    let groups = manager.list_backups(0).await.unwrap();
    assert_eq!(groups[0].index, 1);
    manager.shutdown().await;
    assert_eq!(manager.state(), ManagerState::Stopped);
}

#[tokio::test]
async fn test_shutdown_during_debounce_skips_capture() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp).with_debounce_wait(Duration::from_secs(60));
    let content = config.content_dir.clone();
    let store = config.store_dir.clone();
    let manager = BackupManager::new(config);
    manager.start("debounce-test").await.unwrap();

    fs::write(content.join("autosave_2.save"), b"autosave").unwrap();
    // Give the watcher time to schedule the capture
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .expect("shutdown should not wait for the debounce");
    assert!(store_names(&store).is_empty());
}

#[tokio::test]
async fn test_concurrent_captures_get_unique_indices() {
    let temp = TempDir::new().unwrap();
    let manager = BackupManager::new(test_config(&temp));

    let mut captures = JoinSet::new();
    for i in 0..8 {
        let manager = manager.clone();
        let mode = ["zip", "tar", "copy"][i % 3];
        captures.spawn(async move { manager.create_backup(mode).await });
    }

    let mut indices = BTreeSet::new();
    while let Some(joined) = captures.join_next().await {
        let group = joined.unwrap().unwrap().expect("content is not empty");
        assert!(indices.insert(group.index), "index {} assigned twice", group.index);
    }
    assert_eq!(indices, (1..=8).collect::<BTreeSet<u32>>());

    let listed: Vec<u32> = manager.list_backups(3).await.unwrap().iter().map(|g| g.index).collect();
    assert_eq!(listed, vec![8, 7, 6]);
}

#[tokio::test]
async fn test_cleanup_loop_applies_retention() {
    let temp = TempDir::new().unwrap();
    let retention = RetentionPolicy {
        keep_last_n: 2,
        keep_daily_for: Duration::ZERO,
        keep_weekly_for: Duration::ZERO,
        keep_monthly_for: Duration::ZERO,
        cleanup_interval: Duration::from_millis(100),
    };
    let config = test_config(&temp)
        .with_retention(retention)
        .with_cleanup_enabled(true)
        .with_debounce_wait(Duration::from_secs(60));
    let manager = BackupManager::new(config);
    for _ in 0..4 {
        manager.create_backup("zip").await.unwrap();
    }
    manager.start("cleanup-test").await.unwrap();

    let mut remaining = Vec::new();
    for _ in 0..100 {
        remaining = manager.list_backups(0).await.unwrap();
        if remaining.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let indices: Vec<u32> = remaining.iter().map(|g| g.index).collect();
    assert_eq!(indices, vec![4, 3]);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_capture_interval_takes_scheduled_backups() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp)
        .with_capture_interval(Duration::from_millis(100))
        .with_debounce_wait(Duration::from_secs(60));
    let store = config.store_dir.clone();
    let manager = BackupManager::new(config);
    manager.start("schedule-test").await.unwrap();

    // One capture right after start, more on every tick
    assert!(wait_for_backups(&manager, 3).await, "no scheduled captures");
    manager.shutdown().await;

    let count = store_names(&store).len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store_names(&store).len(), count, "capture after shutdown");

    let indices: BTreeSet<u32> = store_names(&store)
        .iter()
        .filter_map(|name| name.strip_prefix("backup(")?.split(')').next()?.parse().ok())
        .collect();
    assert_eq!(indices, (1..=count as u32).collect::<BTreeSet<u32>>());
}

#[tokio::test]
async fn test_operations_after_shutdown_are_cancelled() {
    let temp = TempDir::new().unwrap();
    let manager = BackupManager::new(test_config(&temp));
    manager.start("stopped-test").await.unwrap();
    manager.shutdown().await;
    manager.shutdown().await;

    assert!(matches!(manager.create_backup("zip").await, Err(BackupError::Cancelled)));
    assert!(matches!(manager.restore_backup(1, true).await, Err(BackupError::Cancelled)));
    assert!(matches!(manager.cleanup().await, Err(BackupError::Cancelled)));
}

#[tokio::test]
async fn test_registry_swap_stops_previous_manager() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let registry = BackupRegistry::new();
    let mut updates = registry.subscribe();

    let first = registry.install_and_start(config.clone()).await.unwrap();
    updates.changed().await.unwrap();
    assert!(updates.borrow_and_update().is_some());

    let second = registry.install_and_start(config).await.unwrap();
    assert_eq!(first.state(), ManagerState::Stopped);
    assert!(second.is_running());

    // Callers resolving the manager per call always reach the live one
    let current = registry.current().unwrap();
    assert!(current.is_running());
    current.create_backup("zip").await.unwrap();
    assert_eq!(second.list_backups(0).await.unwrap().len(), 1);

    registry.shutdown().await;
    assert_eq!(second.state(), ManagerState::Stopped);
    assert!(registry.current().is_none());
}
