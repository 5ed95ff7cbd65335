//! Configuration loading for sync-engine.
//!
//! Configuration is loaded from a TOML file:
//!
//! ```toml
//! [device]
//! name = "laptop"
//!
//! [[folders]]
//! id = "default"
//! path = "/home/me/Sync"
//! devices = ["<base64 device id>"]
//! versioning = "trashcan"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use sync_types::DeviceId;

/// Root configuration for the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// This device.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Shared folders.
    #[serde(default)]
    pub folders: Vec<FolderConfig>,
}

/// Local device configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Human-readable device name (default: "syncmesh").
    #[serde(default = "default_device_name")]
    pub name: String,
}

/// What happens to a file's old content before it is overwritten or deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersioningKind {
    /// Old content is discarded.
    #[default]
    None,
    /// Old content is moved to `.syncmesh/trash`.
    Trashcan,
}

/// One shared folder.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderConfig {
    /// Folder ID, identical on every device sharing the folder.
    pub id: String,
    /// Local root directory.
    pub path: PathBuf,
    /// Devices the folder is shared with (base64 device IDs).
    #[serde(default)]
    pub devices: Vec<String>,
    /// Pull scheduler interval in milliseconds (default: 5000).
    #[serde(default = "default_pull_interval_ms")]
    pub pull_interval_ms: u64,
    /// Full rescan interval in seconds (default: 60, 0 disables).
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Maximum files handled per pull cycle (default: 100).
    #[serde(default = "default_pull_batch_size")]
    pub pull_batch_size: usize,
    /// Copier workers (default: 1).
    #[serde(default = "default_copiers")]
    pub copiers: usize,
    /// Concurrent block requests (default: 16).
    #[serde(default = "default_pullers")]
    pub pullers: usize,
    /// Versioning backend (default: none).
    #[serde(default)]
    pub versioning: VersioningKind,
}

// Default value functions
fn default_device_name() -> String {
    "syncmesh".to_string()
}

fn default_pull_interval_ms() -> u64 {
    5000
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_pull_batch_size() -> usize {
    100
}

fn default_copiers() -> usize {
    1
}

fn default_pullers() -> usize {
    16
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
        }
    }
}

impl FolderConfig {
    /// Folder with default tuning.
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            devices: Vec::new(),
            pull_interval_ms: default_pull_interval_ms(),
            scan_interval_secs: default_scan_interval_secs(),
            pull_batch_size: default_pull_batch_size(),
            copiers: default_copiers(),
            pullers: default_pullers(),
            versioning: VersioningKind::default(),
        }
    }

    /// Share the folder with `device`.
    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.devices.push(device.to_string());
        self
    }

    /// Set the versioning backend.
    pub fn with_versioning(mut self, versioning: VersioningKind) -> Self {
        self.versioning = versioning;
        self
    }

    /// Pull scheduler interval.
    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }

    /// Rescan interval, `None` when periodic scans are off.
    pub fn scan_interval(&self) -> Option<Duration> {
        (self.scan_interval_secs > 0).then(|| Duration::from_secs(self.scan_interval_secs))
    }

    /// Parsed device IDs.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first ID that does not parse.
    pub fn device_ids(&self) -> Result<Vec<DeviceId>, ConfigError> {
        self.devices
            .iter()
            .map(|s| {
                DeviceId::from_str(s).map_err(|e| ConfigError::Invalid {
                    folder: self.id.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Check the folder for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            folder: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("folder id is empty"));
        }
        if self.pull_batch_size == 0 {
            return Err(invalid("pull_batch_size must be at least 1"));
        }
        if self.copiers == 0 {
            return Err(invalid("copiers must be at least 1"));
        }
        if self.pullers == 0 {
            return Err(invalid("pullers must be at least 1"));
        }
        if self.pull_interval_ms == 0 {
            return Err(invalid("pull_interval_ms must be at least 1"));
        }
        self.device_ids()?;
        Ok(())
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Validate every folder and reject duplicate IDs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for folder in &self.folders {
            folder.validate()?;
            if !seen.insert(folder.id.as_str()) {
                return Err(ConfigError::Invalid {
                    folder: folder.id.clone(),
                    reason: "duplicate folder id".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A folder has an unusable value.
    #[error("invalid folder {folder}: {reason}")]
    Invalid {
        /// Folder ID.
        folder: String,
        /// What is wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn folder_defaults() {
        let folder = FolderConfig::new("default", "/tmp/sync");
        assert_eq!(folder.pull_interval(), Duration::from_secs(5));
        assert_eq!(folder.scan_interval(), Some(Duration::from_secs(60)));
        assert_eq!(folder.pull_batch_size, 100);
        assert_eq!(folder.copiers, 1);
        assert_eq!(folder.pullers, 16);
        assert_eq!(folder.versioning, VersioningKind::None);
        assert!(folder.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let device = DeviceId::random();
        let toml = format!(
            r#"
[device]
name = "laptop"

[[folders]]
id = "photos"
path = "/data/photos"
devices = ["{device}"]
pullers = 4
versioning = "trashcan"
"#
        );

        let config: EngineConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config.device.name, "laptop");
        let folder = &config.folders[0];
        assert_eq!(folder.id, "photos");
        assert_eq!(folder.path, PathBuf::from("/data/photos"));
        assert_eq!(folder.pullers, 4);
        assert_eq!(folder.copiers, 1);
        assert_eq!(folder.versioning, VersioningKind::Trashcan);
        assert_eq!(folder.device_ids().unwrap(), vec![device]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_missing_fields_use_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.device.name, "syncmesh");
        assert!(config.folders.is_empty());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut folder = FolderConfig::new("f", "/x");
        folder.pullers = 0;
        assert!(matches!(folder.validate(), Err(ConfigError::Invalid { .. })));

        let mut folder = FolderConfig::new("f", "/x");
        folder.copiers = 0;
        assert!(folder.validate().is_err());

        let mut folder = FolderConfig::new("f", "/x");
        folder.pull_batch_size = 0;
        assert!(folder.validate().is_err());

        assert!(FolderConfig::new("  ", "/x").validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_device_and_duplicates() {
        let mut folder = FolderConfig::new("f", "/x");
        folder.devices.push("not a device".into());
        assert!(folder.validate().is_err());

        let config = EngineConfig {
            device: DeviceConfig::default(),
            folders: vec![FolderConfig::new("f", "/x"), FolderConfig::new("f", "/y")],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[folders]]\nid = \"a\"\npath = \"/a\"").unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.folders[0].id, "a");

        let missing = EngineConfig::from_file(Path::new("/nonexistent/syncmesh.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "folders = 3").unwrap();
        assert!(matches!(
            EngineConfig::from_file(bad.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
