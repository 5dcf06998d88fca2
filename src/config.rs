use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SUBSCRIBER_BUFFER};
use crate::history::{DEFAULT_HISTORY_CAPACITY, DEFAULT_OUTPUT_CAP};

/// Engine tuning, loaded from TOML. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// History entries kept per node.
    pub history_capacity: usize,
    /// Characters of output stored in each history entry.
    pub output_cap_chars: usize,
    /// Idle lifetime of a live subscriber.
    pub subscriber_idle_timeout_secs: u64,
    /// Events a subscriber may have queued before it is dropped.
    pub subscriber_buffer: usize,
    /// Execution budget when a request names none.
    pub default_timeout_secs: u64,
    /// Extra time allowed past the budget before a session is timed out.
    pub timeout_grace_secs: u64,
    /// How often the reaper looks for overdue sessions.
    pub reap_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            output_cap_chars: DEFAULT_OUTPUT_CAP,
            subscriber_idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            default_timeout_secs: 300,
            timeout_grace_secs: 30,
            reap_interval_secs: 10,
        }
    }
}

impl EngineConfig {
    /// Read engine settings from `path`; `Ok(None)` when there is no file.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_owned(), e))?;
        toml::from_str(&text)
            .map(Some)
            .map_err(|e| ConfigError::ParseFailed(path.to_owned(), e))
    }

    /// Write the settings to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_failed = |e: std::io::Error| ConfigError::WriteFailed(path.to_owned(), e);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_failed)?;
        }
        std::fs::write(path, self.to_toml()?).map_err(write_failed)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn subscriber_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.subscriber_idle_timeout_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn timeout_grace(&self) -> Duration {
        Duration::from_secs(self.timeout_grace_secs)
    }

    /// Reaper period; never zero.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Errors that can occur when loading or saving config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("failed to write config {}: {}", .0.display(), .1)]
    WriteFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.output_cap_chars, 5000);
        assert_eq!(config.subscriber_idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn partial_file_overrides_fields() {
        let config: EngineConfig = toml::from_str(
            r#"
            history_capacity = 10
            timeout_grace_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.timeout_grace(), Duration::from_secs(5));
        assert_eq!(config.default_timeout_secs, 300);
    }

    #[test]
    fn reap_interval_never_zero() {
        let config = EngineConfig { reap_interval_secs: 0, ..EngineConfig::default() };
        assert_eq!(config.reap_interval(), Duration::from_secs(1));
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = EngineConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleet-exec.toml");
        let config = EngineConfig { subscriber_buffer: 64, ..EngineConfig::default() };
        config.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn parse_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "history_capacity = \"lots\"").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
        assert!(err.to_string().contains("bad.toml"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
