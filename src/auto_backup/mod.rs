pub mod archive;
pub mod capture;
pub mod indexer;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod restore;
pub mod retention;

pub use archive::ArchiveFormat;
pub use capture::CaptureMode;
pub use indexer::{BackupGroup, BackupLayout};
pub use manager::{BackupManager, ManagerState};
pub use monitor::{ChangeObserver, ObserverHandle};
pub use registry::BackupRegistry;
pub use retention::RetentionPolicy;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

const DEFAULT_DEBOUNCE_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_INIT_POLL_INTERVAL: Duration = Duration::from_millis(2500);
// The game may take a long time to write its first save on a fresh install.
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(90 * 60);

/// Configuration for one backup manager instance.
///
/// A manager never sees its config change. Reloading settings builds a new
/// config and swaps the manager through [`BackupRegistry::install`].
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// World/save name, used for the live head save file name
    pub world_name: String,
    /// Live directory written by the game server
    pub content_dir: PathBuf,
    /// Archive store owned by this engine
    pub store_dir: PathBuf,
    pub retention: RetentionPolicy,
    /// Delay between a creation event and the capture it triggers
    pub debounce_wait: Duration,
    /// Free-form tag used to correlate log lines
    pub identifier: String,
    /// Whether the periodic retention sweep runs
    pub cleanup_enabled: bool,
    /// Archive mode used for automatic captures
    pub capture_mode: CaptureMode,
    /// Period of scheduled captures. Zero disables them.
    pub capture_interval: Duration,
    /// Deflate zip entries / gzip tar archives
    pub compress: bool,
    pub init_poll_interval: Duration,
    pub init_timeout: Duration,
}

impl BackupConfig {
    pub fn new(
        world_name: impl Into<String>,
        content_dir: impl Into<PathBuf>,
        store_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            world_name: world_name.into(),
            content_dir: content_dir.into(),
            store_dir: store_dir.into(),
            retention: RetentionPolicy::default(),
            debounce_wait: DEFAULT_DEBOUNCE_WAIT,
            identifier: String::new(),
            cleanup_enabled: true,
            capture_mode: CaptureMode::Zip,
            capture_interval: Duration::ZERO,
            compress: true,
            init_poll_interval: DEFAULT_INIT_POLL_INTERVAL,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_debounce_wait(mut self, wait: Duration) -> Self {
        self.debounce_wait = wait;
        self
    }

    pub fn with_capture_mode(mut self, mode: CaptureMode) -> Self {
        self.capture_mode = mode;
        self
    }

    pub fn with_capture_interval(mut self, interval: Duration) -> Self {
        self.capture_interval = interval;
        self
    }

    pub fn with_cleanup_enabled(mut self, enabled: bool) -> Self {
        self.cleanup_enabled = enabled;
        self
    }

    pub fn with_init_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.init_poll_interval = poll_interval;
        self.init_timeout = timeout;
        self
    }
}

/// Result type for backup operations
pub type BackupResult<T> = Result<T, BackupError>;

// Error types for backup operations
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("File system error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to prepare directory {}: {source}", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to watch {}: {source}", path.display())]
    WatchSetup {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("Timed out after {}s waiting for content directory {} to be created", waited.as_secs(), path.display())]
    Timeout { path: PathBuf, waited: Duration },

    #[error("Backup store {} does not exist yet. Start the game server once so it creates its save folder: {source}", path.display())]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No backup found with index {0}")]
    NotFound(u32),

    #[error("Unsupported backup mode: {0}")]
    InvalidMode(String),

    #[error("Invalid backup index: {0}")]
    InvalidIndex(i64),

    #[error("No backup index left above {0}")]
    IndexExhausted(u32),

    #[error("Refusing to extract unsafe archive entry: {0}")]
    UnsafeEntry(String),

    #[error("{failed} of {total} files could not be {action}")]
    PartialFailure {
        action: &'static str,
        failed: usize,
        total: usize,
    },

    #[error("Backup manager is shutting down")]
    Cancelled,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

/// Coarse classification handed to callers that map errors to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupErrorKind {
    Setup,
    Timeout,
    NotFound,
    Io,
    PartialFailure,
    InvalidRequest,
    Cancelled,
    Configuration,
}

impl BackupError {
    pub fn kind(&self) -> BackupErrorKind {
        match self {
            BackupError::Setup { .. } | BackupError::WatchSetup { .. } => BackupErrorKind::Setup,
            BackupError::Timeout { .. } => BackupErrorKind::Timeout,
            BackupError::NotFound(_) => BackupErrorKind::NotFound,
            BackupError::InvalidMode(_) | BackupError::InvalidIndex(_) => {
                BackupErrorKind::InvalidRequest
            }
            BackupError::PartialFailure { .. } => BackupErrorKind::PartialFailure,
            BackupError::Cancelled => BackupErrorKind::Cancelled,
            BackupError::Configuration(_) => BackupErrorKind::Configuration,
            BackupError::Io(_)
            | BackupError::Walk(_)
            | BackupError::Zip(_)
            | BackupError::StoreUnavailable { .. }
            | BackupError::UnsafeEntry(_)
            | BackupError::IndexExhausted(_)
            | BackupError::Task(_) => BackupErrorKind::Io,
        }
    }

    /// True for errors caused by the request rather than the host.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            BackupErrorKind::InvalidRequest | BackupErrorKind::NotFound
        )
    }
}

impl From<BackupError> for String {
    fn from(error: BackupError) -> String {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(BackupError::NotFound(3).kind(), BackupErrorKind::NotFound);
        assert!(BackupError::InvalidMode("rar".into()).is_client_error());
        assert!(!BackupError::Cancelled.is_client_error());
        let timeout = BackupError::Timeout {
            path: PathBuf::from("saves/Mars"),
            waited: Duration::from_secs(5400),
        };
        assert_eq!(timeout.kind(), BackupErrorKind::Timeout);
        assert!(timeout.to_string().contains("5400s"));
    }

    #[test]
    fn test_config_defaults() {
        let config = BackupConfig::new("Mars", "saves/Mars", "saves/Mars/Safebackups");
        assert_eq!(config.debounce_wait, Duration::from_secs(30));
        assert_eq!(config.init_poll_interval, Duration::from_millis(2500));
        assert_eq!(config.init_timeout, Duration::from_secs(5400));
        assert_eq!(config.capture_mode, CaptureMode::Zip);
        assert!(config.cleanup_enabled);
        assert!(config.capture_interval.is_zero());
    }
}
