//! Settings file for the backup engine
//!
//! ```yaml
//! world_name: Mars
//! content_dir: ./saves/Mars
//! backup:
//!   mode: zip
//!   debounce_wait_secs: 30
//! retention:
//!   keep_last_n: 10
//!   keep_daily_days: 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auto_backup::{BackupConfig, CaptureMode, RetentionPolicy};
use crate::logger::LogConfig;

const DEFAULT_STORE_NAME: &str = "Safebackups";
const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub world_name: String,
    pub content_dir: PathBuf,
    /// Defaults to `<content_dir>/Safebackups`
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub mode: CaptureMode,
    pub compress: bool,
    pub debounce_wait_secs: u64,
    pub cleanup_enabled: bool,
    /// Minutes between scheduled captures, 0 turns them off
    pub capture_interval_minutes: u64,
    pub init_poll_interval_ms: u64,
    pub init_timeout_minutes: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Zip,
            compress: true,
            debounce_wait_secs: 30,
            cleanup_enabled: true,
            capture_interval_minutes: 0,
            init_poll_interval_ms: 2500,
            init_timeout_minutes: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub keep_last_n: usize,
    pub keep_daily_days: u64,
    pub keep_weekly_days: u64,
    pub keep_monthly_days: u64,
    /// Zero disables the periodic sweep
    pub cleanup_interval_minutes: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            keep_last_n: 10,
            keep_daily_days: 30,
            keep_weekly_days: 90,
            keep_monthly_days: 365,
            cleanup_interval_minutes: 60,
        }
    }
}

impl RetentionSettings {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_last_n: self.keep_last_n,
            keep_daily_for: Duration::from_secs(self.keep_daily_days.saturating_mul(DAY_SECS)),
            keep_weekly_for: Duration::from_secs(self.keep_weekly_days.saturating_mul(DAY_SECS)),
            keep_monthly_for: Duration::from_secs(self.keep_monthly_days.saturating_mul(DAY_SECS)),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_minutes.saturating_mul(60)),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.world_name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid("world_name must not be empty".to_string()));
        }
        if name.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "world_name must be a plain file name, got {:?}",
                self.world_name
            )));
        }
        if self.content_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("content_dir must not be empty".to_string()));
        }
        if self.store_dir() == self.content_dir {
            return Err(ConfigError::Invalid(
                "store_dir must differ from content_dir".to_string(),
            ));
        }
        if self.backup.init_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "backup.init_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| self.content_dir.join(DEFAULT_STORE_NAME))
    }

    pub fn backup_config(&self) -> Result<BackupConfig, ConfigError> {
        self.validate()?;
        let backup = &self.backup;
        let mut config = BackupConfig::new(self.world_name.trim(), &self.content_dir, self.store_dir())
            .with_identifier(self.identifier.clone())
            .with_retention(self.retention.policy())
            .with_debounce_wait(Duration::from_secs(backup.debounce_wait_secs))
            .with_capture_mode(backup.mode)
            .with_cleanup_enabled(backup.cleanup_enabled)
            .with_capture_interval(Duration::from_secs(backup.capture_interval_minutes.saturating_mul(60)))
            .with_init_timing(
                Duration::from_millis(backup.init_poll_interval_ms),
                Duration::from_secs(backup.init_timeout_minutes.saturating_mul(60)),
            );
        config.compress = backup.compress;
        Ok(config)
    }

    pub fn log_config(&self) -> LogConfig {
        self.logging.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_settings_use_defaults() {
        let settings = Settings::from_yaml("world_name: Mars\ncontent_dir: saves/Mars\n").unwrap();
        let config = settings.backup_config().unwrap();
        assert_eq!(config.store_dir, PathBuf::from("saves/Mars/Safebackups"));
        assert_eq!(config.retention, RetentionPolicy::default());
        assert_eq!(config.debounce_wait, Duration::from_secs(30));
        assert!(config.capture_interval.is_zero());
        assert_eq!(config.init_timeout, Duration::from_secs(90 * 60));
        assert_eq!(config.capture_mode, CaptureMode::Zip);
    }

    #[test]
    fn test_overrides() {
        let yaml = r#"
world_name: Europa
content_dir: /srv/saves/Europa
store_dir: /srv/backups/Europa
identifier: europa-1
backup:
  mode: tar
  compress: false
  cleanup_enabled: false
  capture_interval_minutes: 15
retention:
  keep_last_n: 3
  cleanup_interval_minutes: 0
logging:
  directory: /var/log/steward
  file_prefix: steward.log
  level: debug
  enable_console_output: false
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        let config = settings.backup_config().unwrap();
        assert_eq!(config.capture_mode, CaptureMode::Tar);
        assert!(!config.compress);
        assert!(!config.cleanup_enabled);
        assert_eq!(config.capture_interval, Duration::from_secs(15 * 60));
        assert_eq!(config.retention.keep_last_n, 3);
        assert!(config.retention.cleanup_interval.is_zero());
        assert_eq!(config.identifier, "europa-1");
        assert_eq!(settings.log_config().file_prefix, "steward.log");
    }

    #[test]
    fn test_invalid_settings() {
        assert!(matches!(
            Settings::from_yaml("world_name: ''\ncontent_dir: saves\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_yaml("world_name: a/b\ncontent_dir: saves\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_yaml("world_name: Mars\ncontent_dir: saves\nstore_dir: saves\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_yaml("world_name: Mars\ncontent_dir: saves\nbackup:\n  mode: rar\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
