use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use notify::{Event, EventKind};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::auto_backup::capture::{self, CaptureMode};
use crate::auto_backup::indexer::{self, BackupGroup};
use crate::auto_backup::monitor::{ChangeObserver, ObserverHandle};
use crate::auto_backup::restore::{self, RestoreReport};
use crate::auto_backup::retention::{self, CleanupReport};
use crate::auto_backup::{BackupConfig, BackupError, BackupResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Created,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
    /// Initialization or watch setup failed
    Failed,
}

/// Owns the lifecycle of one content directory and its backup store.
///
/// Every mutating operation and every listing runs under one operation lock,
/// so index assignment, restore and retention never interleave.
#[derive(Clone)]
pub struct BackupManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: BackupConfig,
    op_lock: tokio::sync::Mutex<()>,
    observer: Mutex<Option<ObserverHandle>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    state: Mutex<ManagerState>,
}

impl BackupManager {
    pub fn new(config: BackupConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                op_lock: tokio::sync::Mutex::new(()),
                observer: Mutex::new(None),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                state: Mutex::new(ManagerState::Created),
            }),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    /// Wait for the content directory to appear, then create the store.
    ///
    /// The result is delivered on the returned channel once the directory
    /// shows up, the wait times out, or the manager shuts down.
    pub fn initialize(&self, identifier: &str) -> oneshot::Receiver<BackupResult<()>> {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.inner.ensure_accepting() {
            let _ = tx.send(Err(e));
            return rx;
        }

        let inner = self.inner.clone();
        let span = manager_span(&self.inner.config, identifier);
        self.inner.tracker.spawn(
            async move {
                let result = inner.wait_for_content().await;
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Initialization did not complete");
                }
                let _ = tx.send(result);
            }
            .instrument(span),
        );
        rx
    }

    /// Initialize, start watching the content directory and start the
    /// retention and capture timers.
    pub async fn start(&self, identifier: &str) -> BackupResult<()> {
        {
            let mut state = self.inner.state();
            match *state {
                ManagerState::Running | ManagerState::Initializing => return Ok(()),
                ManagerState::ShuttingDown | ManagerState::Stopped => return Err(BackupError::Cancelled),
                ManagerState::Created | ManagerState::Failed => *state = ManagerState::Initializing,
            }
        }

        match self.start_inner(identifier).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A shutdown that already began keeps its own state
                self.inner.transition(ManagerState::Initializing, ManagerState::Failed);
                Err(e)
            }
        }
    }

    /// Run [`start`](Self::start) on the manager's own task tracker, so
    /// `shutdown` also waits for the attempt. Failures are logged.
    pub fn spawn_start(&self, identifier: &str) {
        let manager = self.clone();
        let identifier = identifier.to_string();
        self.inner.tracker.spawn(async move {
            match manager.start(&identifier).await {
                Ok(()) => {}
                Err(BackupError::Cancelled) => {
                    tracing::debug!(identifier = %identifier, "Backup manager start cancelled")
                }
                Err(e) => {
                    tracing::error!(identifier = %identifier, error = %e, "Backup manager failed to start")
                }
            }
        });
    }

    async fn start_inner(&self, identifier: &str) -> BackupResult<()> {
        let init = self.initialize(identifier);
        init.await.map_err(|_| BackupError::Cancelled)??;

        let config = &self.inner.config;
        let span = manager_span(config, identifier);
        let observer = ChangeObserver::watch_excluding(
            &config.content_dir,
            identifier,
            &self.inner.tracker,
            &[config.store_dir.clone()],
        )?;
        let (handle, events, errors) = observer.into_parts();
        *self.inner.observer() = Some(handle.clone());

        // Shutdown flips the state under this lock before it closes the
        // tracker, so loops spawned here are always waited for.
        {
            let mut state = self.inner.state();
            if *state != ManagerState::Initializing || self.inner.cancel.is_cancelled() {
                drop(state);
                handle.close();
                return Err(BackupError::Cancelled);
            }

            let filter = EventFilter::new(config);
            self.inner.tracker.spawn(
                self.inner
                    .clone()
                    .watch_loop(handle, events, errors, filter)
                    .instrument(span.clone()),
            );

            let period = config.retention.cleanup_interval;
            if config.cleanup_enabled && !period.is_zero() {
                self.inner
                    .tracker
                    .spawn(self.inner.clone().cleanup_loop(period).instrument(span.clone()));
            }

            if !config.capture_interval.is_zero() {
                self.inner.tracker.spawn(
                    self.inner
                        .clone()
                        .capture_loop(config.capture_interval)
                        .instrument(span.clone()),
                );
            }

            *state = ManagerState::Running;
        }
        span.in_scope(|| {
            tracing::info!(
                content = %config.content_dir.display(),
                store = %config.store_dir.display(),
                "Backup manager running"
            )
        });
        Ok(())
    }

    /// Stop every task and release the watch. Safe to call more than once.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state();
            if *state != ManagerState::Stopped {
                *state = ManagerState::ShuttingDown;
            }
        }

        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.observer().take() {
            handle.close();
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        // Let an in-flight operation finish before reporting stopped
        let _guard = self.inner.op_lock.lock().await;

        self.inner.set_state(ManagerState::Stopped);
        tracing::info!(content = %self.inner.config.content_dir.display(), "Backup manager stopped");
    }

    /// Capture the content directory now. `mode` is `copy`, `tar` or `zip`.
    pub async fn create_backup(&self, mode: &str) -> BackupResult<Option<BackupGroup>> {
        let mode: CaptureMode = mode.parse()?;
        self.inner.ensure_accepting()?;
        self.inner.capture(mode).await
    }

    /// Complete groups, highest index first. `limit <= 0` returns all.
    pub async fn list_backups(&self, limit: i64) -> BackupResult<Vec<BackupGroup>> {
        self.inner.ensure_accepting()?;
        let _guard = self.inner.op_lock.lock().await;
        let inner = self.inner.clone();
        let mut groups =
            tokio::task::spawn_blocking(move || indexer::list_groups(&inner.config.store_dir)).await??;

        groups.sort_by(|a, b| b.index.cmp(&a.index));
        if limit > 0 {
            groups.truncate(limit as usize);
        }
        Ok(groups)
    }

    pub async fn restore_backup(&self, index: i64, skip_pre_backup: bool) -> BackupResult<RestoreReport> {
        let index = u32::try_from(index).map_err(|_| BackupError::InvalidIndex(index))?;
        self.inner.ensure_accepting()?;
        let _guard = self.inner.op_lock.lock().await;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || restore::restore_group(&inner.config, index, skip_pre_backup))
            .await?
    }

    /// Run one retention sweep now.
    pub async fn cleanup(&self) -> BackupResult<CleanupReport> {
        self.inner.ensure_accepting()?;
        self.inner.cleanup().await?.into_result()
    }
}

impl ManagerInner {
    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: ManagerState) {
        *self.state() = next;
    }

    /// Move to `next` only if the state is still `from`.
    fn transition(&self, from: ManagerState, next: ManagerState) -> bool {
        let mut state = self.state();
        if *state != from {
            return false;
        }
        *state = next;
        true
    }

    fn observer(&self) -> MutexGuard<'_, Option<ObserverHandle>> {
        self.observer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_accepting(&self) -> BackupResult<()> {
        let stopping = matches!(*self.state(), ManagerState::ShuttingDown | ManagerState::Stopped);
        if stopping || self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        Ok(())
    }

    async fn wait_for_content(&self) -> BackupResult<()> {
        let config = &self.config;
        let deadline = Instant::now() + config.init_timeout;

        loop {
            match tokio::fs::metadata(&config.content_dir).await {
                Ok(metadata) if metadata.is_dir() => break,
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BackupError::Timeout {
                    path: config.content_dir.clone(),
                    waited: config.init_timeout,
                });
            }
            let pause = config.init_poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(BackupError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tokio::fs::create_dir_all(&config.store_dir)
            .await
            .map_err(|source| BackupError::Setup {
                path: config.store_dir.clone(),
                source,
            })?;
        tracing::debug!(store = %config.store_dir.display(), "Backup store ready");
        Ok(())
    }

    async fn capture(self: &Arc<Self>, mode: CaptureMode) -> BackupResult<Option<BackupGroup>> {
        let _guard = tokio::select! {
            _ = self.cancel.cancelled() => return Err(BackupError::Cancelled),
            guard = self.op_lock.lock() => guard,
        };
        let inner = self.clone();
        tokio::task::spawn_blocking(move || capture::capture_snapshot(&inner.config, mode)).await?
    }

    async fn cleanup(self: &Arc<Self>) -> BackupResult<CleanupReport> {
        let _guard = self.op_lock.lock().await;
        let inner = self.clone();
        tokio::task::spawn_blocking(move || {
            retention::run_cleanup(&inner.config.store_dir, &inner.config.retention, Utc::now())
        })
        .await?
    }

    async fn watch_loop(
        self: Arc<Self>,
        handle: ObserverHandle,
        mut events: mpsc::Receiver<Event>,
        mut errors: mpsc::Receiver<notify::Error>,
        filter: EventFilter,
    ) {
        let mut errors_open = true;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = handle.closed() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(path) = event.paths.iter().find(|p| filter.accepts(&event.kind, p)) {
                            tracing::debug!(path = %path.display(), "New file detected, scheduling capture");
                            self.spawn_capture();
                        }
                    }
                    None => break,
                },
                error = errors.recv(), if errors_open => match error {
                    Some(error) => tracing::warn!(error = %error, "File watcher error"),
                    None => errors_open = false,
                },
            }
        }
        handle.close();
        tracing::debug!("Watch loop stopped");
    }

    fn spawn_capture(self: &Arc<Self>) {
        let inner = self.clone();
        self.tracker.spawn(
            async move {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        tracing::debug!("Capture abandoned during debounce");
                        return;
                    }
                    _ = tokio::time::sleep(inner.config.debounce_wait) => {}
                }
                match inner.capture(inner.config.capture_mode).await {
                    Ok(Some(group)) => tracing::debug!(index = group.index, "Automatic capture finished"),
                    Ok(None) => {}
                    Err(BackupError::Cancelled) => tracing::debug!("Capture cancelled"),
                    Err(e) => tracing::error!(error = %e, "Automatic capture failed"),
                }
            }
            .in_current_span(),
        );
    }

    async fn cleanup_loop(self: Arc<Self>, period: std::time::Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => match self.cleanup().await {
                    Ok(report) if report.failed_paths.is_empty() => tracing::info!(
                        kept = report.kept,
                        deleted = report.deleted_groups.len(),
                        "Retention sweep finished"
                    ),
                    Ok(report) => tracing::warn!(
                        kept = report.kept,
                        deleted = report.deleted_groups.len(),
                        failed = report.failed_paths.len(),
                        "Retention sweep finished with failures"
                    ),
                    Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
                },
            }
        }
        tracing::debug!("Cleanup loop stopped");
    }

    /// One capture right away, then one per `period` until shutdown.
    async fn capture_loop(self: Arc<Self>, period: std::time::Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => match self.capture(self.config.capture_mode).await {
                    Ok(Some(group)) => tracing::info!(index = group.index, "Scheduled capture finished"),
                    Ok(None) => {}
                    Err(BackupError::Cancelled) => break,
                    Err(e) => tracing::error!(error = %e, "Scheduled capture failed"),
                },
            }
        }
        tracing::debug!("Capture loop stopped");
    }
}

fn manager_span(config: &BackupConfig, identifier: &str) -> tracing::Span {
    let identifier = if identifier.is_empty() {
        config.identifier.as_str()
    } else {
        identifier
    };
    tracing::info_span!("backup_manager", identifier = %identifier)
}

/// Decides which watch events schedule a capture
struct EventFilter {
    ignored_roots: Vec<PathBuf>,
}

impl EventFilter {
    fn new(config: &BackupConfig) -> Self {
        let mut ignored_roots = vec![config.store_dir.clone()];
        if let Ok(canonical) = std::fs::canonicalize(&config.store_dir) {
            ignored_roots.push(canonical);
        }
        Self { ignored_roots }
    }

    fn accepts(&self, kind: &EventKind, path: &Path) -> bool {
        if !kind.is_create() {
            return false;
        }
        let hidden = path
            .file_name()
            .map_or(true, |name| name.to_string_lossy().starts_with('.'));
        !hidden && !self.ignored_roots.iter().any(|root| path.starts_with(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    #[test]
    fn test_event_filter() {
        let config = BackupConfig::new("Mars", "/saves/Mars", "/saves/Mars/Safebackups");
        let filter = EventFilter::new(&config);
        let create = EventKind::Create(CreateKind::File);

        assert!(filter.accepts(&create, Path::new("/saves/Mars/Mars.save")));
        assert!(filter.accepts(&create, Path::new("/saves/Mars/autosave/autosave_2.save")));
        assert!(!filter.accepts(&EventKind::Modify(ModifyKind::Any), Path::new("/saves/Mars/Mars.save")));
        assert!(!filter.accepts(&create, Path::new("/saves/Mars/Safebackups/backup(3).zip")));
        assert!(!filter.accepts(&create, Path::new("/saves/Mars/.partial-x1y2")));
    }

    #[tokio::test]
    async fn test_operations_rejected_after_shutdown() {
        let temp = tempfile::TempDir::new().unwrap();
        let content = temp.path().join("Mars");
        let manager = BackupManager::new(BackupConfig::new("Mars", &content, content.join("Safebackups")));
        assert_eq!(manager.state(), ManagerState::Created);

        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(matches!(manager.list_backups(0).await, Err(BackupError::Cancelled)));
        assert!(matches!(manager.start("test").await, Err(BackupError::Cancelled)));
        let init = manager.initialize("test").await.unwrap();
        assert!(matches!(init, Err(BackupError::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_racing_start_ends_stopped() {
        let temp = tempfile::TempDir::new().unwrap();
        let content = temp.path().join("Mars");
        std::fs::create_dir_all(&content).unwrap();
        let config = BackupConfig::new("Mars", &content, content.join("Safebackups"))
            .with_cleanup_enabled(false)
            .with_init_timing(std::time::Duration::from_millis(1), std::time::Duration::from_secs(5));

        for _ in 0..20 {
            let manager = BackupManager::new(config.clone());
            let starter = manager.clone();
            let start = tokio::spawn(async move { starter.start("race").await });
            manager.shutdown().await;
            let _ = start.await.unwrap();
            assert_eq!(manager.state(), ManagerState::Stopped);
            assert!(!manager.is_running());
        }
    }

    #[tokio::test]
    async fn test_spawned_start_is_waited_for_by_shutdown() {
        let temp = tempfile::TempDir::new().unwrap();
        let content = temp.path().join("Mars");
        std::fs::create_dir_all(&content).unwrap();
        let manager = BackupManager::new(BackupConfig::new("Mars", &content, content.join("Safebackups")));

        manager.spawn_start("spawned");
        manager.shutdown().await;
        assert_eq!(manager.state(), ManagerState::Stopped);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let temp = tempfile::TempDir::new().unwrap();
        let content = temp.path().join("Mars");
        let manager = BackupManager::new(BackupConfig::new("Mars", &content, content.join("Safebackups")));
        assert!(matches!(
            manager.create_backup("rar").await,
            Err(BackupError::InvalidMode(_))
        ));
        assert!(matches!(
            manager.restore_backup(-1, true).await,
            Err(BackupError::InvalidIndex(-1))
        ));
    }
}
