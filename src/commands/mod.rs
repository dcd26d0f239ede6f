pub mod backup;

use serde::Serialize;

use crate::auto_backup::{BackupError, BackupErrorKind};

/// Error payload returned to the web layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandFailure {
    pub kind: BackupErrorKind,
    pub message: String,
}

impl From<BackupError> for CommandFailure {
    fn from(error: BackupError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl CommandFailure {
    fn no_manager() -> Self {
        Self {
            kind: BackupErrorKind::Setup,
            message: "Backup manager is not running".to_string(),
        }
    }
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CommandFailure {}
