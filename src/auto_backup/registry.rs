use tokio::sync::{watch, Mutex};

use crate::auto_backup::{BackupConfig, BackupManager, BackupResult};

/// Holds the manager that currently owns the store.
///
/// Consumers look the manager up on every call, or subscribe to be told when
/// it is replaced. At most one manager runs per registry: the previous one is
/// shut down completely before the next is published.
pub struct BackupRegistry {
    current: watch::Sender<Option<BackupManager>>,
    swap: Mutex<()>,
}

impl BackupRegistry {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current,
            swap: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Option<BackupManager> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BackupManager>> {
        self.current.subscribe()
    }

    /// Replace the current manager with one built from `config` and start it
    /// in the background. The start runs on the manager's own tracker, so
    /// shutting the manager down also waits for it.
    pub async fn install(&self, config: BackupConfig) -> BackupManager {
        let manager = self.install_idle(config).await;
        let identifier = manager.config().identifier.clone();
        manager.spawn_start(&identifier);
        manager
    }

    /// Replace the current manager and wait for the new one to start.
    pub async fn install_and_start(&self, config: BackupConfig) -> BackupResult<BackupManager> {
        let manager = self.install_idle(config).await;
        let identifier = manager.config().identifier.clone();
        manager.start(&identifier).await?;
        Ok(manager)
    }

    /// Replace the current manager without starting the new one. Listing,
    /// capture and restore work on an idle manager; nothing is watched.
    pub async fn install_idle(&self, config: BackupConfig) -> BackupManager {
        let _swap = self.swap.lock().await;
        if let Some(previous) = self.current.send_replace(None) {
            previous.shutdown().await;
        }
        let manager = BackupManager::new(config);
        self.current.send_replace(Some(manager.clone()));
        manager
    }

    /// Shut the current manager down and leave the registry empty.
    pub async fn shutdown(&self) {
        let _swap = self.swap.lock().await;
        if let Some(previous) = self.current.send_replace(None) {
            previous.shutdown().await;
        }
    }
}

impl Default for BackupRegistry {
    fn default() -> Self {
        Self::new()
    }
}
