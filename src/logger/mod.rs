//! Logging setup for backup-steward
//!
//! Everything logs through `tracing`. This module installs the subscriber:
//! - Daily rolling log file written off the hot path
//! - Optional console output
//! - `RUST_LOG` overrides the configured level

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

// Dropping the guard stops the background writer, so it lives for the whole process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_CONFIG: OnceCell<LogConfig> = OnceCell::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
    pub level: LogLevel,
    pub enable_console_output: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_prefix: "backup-steward.log".to_string(),
            level: LogLevel::Info,
            enable_console_output: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("Failed to create log directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Logging is already initialized")]
    AlreadyInitialized,
}

/// Initialize the logging system with default configuration
pub fn initialize_logging() -> Result<(), LoggerError> {
    initialize_logging_with_config(LogConfig::default())
}

/// Initialize the logging system with custom configuration
pub fn initialize_logging_with_config(config: LogConfig) -> Result<(), LoggerError> {
    std::fs::create_dir_all(&config.directory).map_err(|source| LoggerError::Directory {
        path: config.directory.clone(),
        source,
    })?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.directive()));

    let appender = tracing_appender::rolling::daily(&config.directory, &config.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);
    let console_layer = config
        .enable_console_output
        .then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|_| LoggerError::AlreadyInitialized)?;

    let _ = FILE_GUARD.set(guard);
    let _ = ACTIVE_CONFIG.set(config.clone());
    tracing::info!(
        directory = %config.directory.display(),
        level = config.level.as_str(),
        "Logging system initialized"
    );
    Ok(())
}

/// Get current log configuration
pub fn get_log_config() -> LogConfig {
    ACTIVE_CONFIG.get().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_levels() {
        assert_eq!(LogLevel::Debug.as_str(), "DEBUG");
        assert_eq!(LogLevel::Info.as_str(), "INFO");
        assert_eq!(LogLevel::Warn.as_str(), "WARN");
        assert_eq!(LogLevel::Error.as_str(), "ERROR");
    }

    #[test]
    fn test_level_from_yaml() {
        let level: LogLevel = serde_yaml::from_str("warn").unwrap();
        assert_eq!(level, LogLevel::Warn);
    }

    #[test]
    fn test_initialize_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let config = LogConfig {
            directory: temp_dir.path().join("logs"),
            file_prefix: "test.log".to_string(),
            level: LogLevel::Debug,
            enable_console_output: false,
        };

        // Another test may have installed a subscriber first
        match initialize_logging_with_config(config) {
            Ok(()) | Err(LoggerError::AlreadyInitialized) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
        assert!(temp_dir.path().join("logs").is_dir());
    }
}
