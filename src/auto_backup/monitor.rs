use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use walkdir::WalkDir;

use crate::auto_backup::{BackupError, BackupResult};

const CHANNEL_CAPACITY: usize = 100;

/// Watches a directory tree and forwards raw filesystem events
pub struct ChangeObserver {
    handle: ObserverHandle,
    events: mpsc::Receiver<Event>,
    errors: mpsc::Receiver<notify::Error>,
}

/// Shutdown side of a [`ChangeObserver`]. Cheap to clone.
#[derive(Clone)]
pub struct ObserverHandle {
    done: CancellationToken,
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
}

impl ChangeObserver {
    /// Watch `root` and every subdirectory that exists right now.
    ///
    /// Directories created later are not picked up.
    pub fn watch(root: &Path, identifier: &str, tracker: &TaskTracker) -> BackupResult<Self> {
        Self::watch_excluding(root, identifier, tracker, &[])
    }

    /// Like [`ChangeObserver::watch`], but subdirectories under any of
    /// `excludes` get no watch of their own.
    pub fn watch_excluding(
        root: &Path,
        identifier: &str,
        tracker: &TaskTracker,
        excludes: &[PathBuf],
    ) -> BackupResult<Self> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                // Receiver is gone once the observer closes
                let _ = raw_tx.send(result);
            },
            notify::Config::default(),
        )
        .map_err(|source| BackupError::WatchSetup {
            path: root.to_path_buf(),
            source,
        })?;

        watcher
            .watch(root, RecursiveMode::NonRecursive)
            .map_err(|source| BackupError::WatchSetup {
                path: root.to_path_buf(),
                source,
            })?;

        let mut watched = 1usize;
        let subdirectories = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !excludes.iter().any(|x| e.path().starts_with(x)));
        for entry in subdirectories {
            match entry {
                Ok(entry) if entry.file_type().is_dir() => {
                    match watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
                        Ok(()) => watched += 1,
                        Err(e) => tracing::warn!(
                            identifier,
                            path = %entry.path().display(),
                            error = %e,
                            "Failed to watch subdirectory"
                        ),
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(identifier, error = %e, "Failed to walk watched tree"),
            }
        }

        tracing::info!(
            identifier,
            root = %root.display(),
            directories = watched,
            "Watching for file changes"
        );

        let (event_tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        let (error_tx, errors) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = ObserverHandle {
            done: CancellationToken::new(),
            watcher: Arc::new(Mutex::new(Some(watcher))),
        };

        let done = handle.done.clone();
        let identifier = identifier.to_string();
        tracker.spawn(async move {
            loop {
                let raw = tokio::select! {
                    _ = done.cancelled() => break,
                    raw = raw_rx.recv() => raw,
                };
                let delivered = match raw {
                    Some(Ok(event)) => tokio::select! {
                        _ = done.cancelled() => break,
                        sent = event_tx.send(event) => sent.is_ok(),
                    },
                    Some(Err(error)) => tokio::select! {
                        _ = done.cancelled() => break,
                        sent = error_tx.send(error) => sent.is_ok(),
                    },
                    None => break,
                };
                if !delivered {
                    break;
                }
            }
            tracing::debug!(identifier = %identifier, "Change observer stopped");
        });

        Ok(Self {
            handle,
            events,
            errors,
        })
    }

    pub fn handle(&self) -> ObserverHandle {
        self.handle.clone()
    }

    /// Split into the shutdown handle and the event and error receivers.
    pub fn into_parts(self) -> (ObserverHandle, mpsc::Receiver<Event>, mpsc::Receiver<notify::Error>) {
        (self.handle, self.events, self.errors)
    }
}

impl ObserverHandle {
    /// Stop forwarding and release the OS watch. Safe to call more than once.
    pub fn close(&self) {
        self.done.cancel();
        if let Ok(mut watcher) = self.watcher.lock() {
            watcher.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once [`ObserverHandle::close`] has been called.
    pub async fn closed(&self) {
        self.done.cancelled().await
    }
}
