//! savesync configuration file parsing (config.toml)

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::error::Result as SyncResult;
use crate::path::PathRoots;
use crate::store::ItemKey;

/// Config file name inside the config directory
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// savesync configuration
#[derive(Debug, serde::Deserialize)]
#[serde(default)]
pub struct SaveSyncConfig {
    /// Remote root handed to the transport, e.g. `gdrive:savesync`
    pub remote: String,

    /// External sync tool to invoke
    pub rclone_binary: PathBuf,

    /// Extra arguments passed to every rclone invocation
    pub rclone_args: Vec<String>,

    /// Where local record sets live (default: platform data dir)
    pub state_dir: Option<PathBuf>,

    pub thresholds: Thresholds,

    pub fetch_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub scan_interval_secs: u64,

    #[serde(rename = "item")]
    pub items: Vec<ItemConfig>,
}

impl Default for SaveSyncConfig {
    fn default() -> Self {
        Self {
            remote: String::new(),
            rclone_binary: PathBuf::from("rclone"),
            rclone_args: Vec::new(),
            state_dir: None,
            thresholds: Thresholds::default(),
            fetch_timeout_secs: 30,
            transfer_timeout_secs: 300,
            scan_interval_secs: 5,
            items: Vec::new(),
        }
    }
}

/// Indifference thresholds per call site
#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// User-initiated sync
    pub manual_minutes: u64,
    /// Check after the application exits
    pub automatic_minutes: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            manual_minutes: 10,
            automatic_minutes: 1,
        }
    }
}

impl Thresholds {
    #[must_use]
    pub fn manual(&self) -> Duration {
        Duration::from_secs(self.manual_minutes * 60)
    }

    #[must_use]
    pub fn automatic(&self) -> Duration {
        Duration::from_secs(self.automatic_minutes * 60)
    }
}

/// One synchronised application
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ItemConfig {
    pub id: String,

    pub install_root: PathBuf,

    #[serde(default = "default_profile")]
    pub profile: String,

    /// Files or folders to track, relative to the install root or starting with a marker
    #[serde(default)]
    pub tracked: Vec<String>,

    /// Flat folder written by older versions, source for `migrate`
    #[serde(default)]
    pub legacy_remote: Option<String>,
}

fn default_profile() -> String {
    "default".to_string()
}

impl ItemConfig {
    /// # Errors
    /// Returns an error if the item or profile id is not usable as a folder name
    pub fn key(&self) -> SyncResult<ItemKey> {
        ItemKey::new(&self.id, &self.profile)
    }

    /// Roots for this item on the current machine
    #[must_use]
    pub fn roots(&self) -> PathRoots {
        PathRoots::detect(&self.install_root)
    }
}

impl SaveSyncConfig {
    /// Platform default location of the config file
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("savesync").join(CONFIG_FILE))
    }

    /// Load config from `path`.
    ///
    /// Returns default config if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn item(&self, id: &str) -> Option<&ItemConfig> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Local record set directory, falling back to the platform data dir
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("savesync")
        })
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    #[must_use]
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
remote = "gdrive:savesync"
rclone_args = ["--fast-list"]
fetch_timeout_secs = 10

[thresholds]
manual_minutes = 15

[[item]]
id = "hollow"
install_root = "/games/hollow"
tracked = ["Saves", "%USERPROFILE%/Documents/Hollow/settings.ini"]

[[item]]
id = "celeste"
install_root = "/games/celeste"
profile = "speedrun"
legacy_remote = "gdrive:old/celeste"
"#;

        let config: SaveSyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.remote, "gdrive:savesync");
        assert_eq!(config.rclone_binary, PathBuf::from("rclone"));
        assert_eq!(config.rclone_args, vec!["--fast-list"]);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(config.transfer_timeout(), Duration::from_secs(300));
        assert_eq!(config.thresholds.manual(), Duration::from_secs(900));
        assert_eq!(config.thresholds.automatic(), Duration::from_secs(60));
        assert_eq!(config.items.len(), 2);

        let hollow = config.item("hollow").unwrap();
        assert_eq!(hollow.profile, "default");
        assert_eq!(hollow.tracked.len(), 2);
        assert!(hollow.legacy_remote.is_none());

        let celeste = config.item("celeste").unwrap();
        assert_eq!(celeste.key().unwrap().to_string(), "celeste/speedrun");
        assert_eq!(celeste.legacy_remote.as_deref(), Some("gdrive:old/celeste"));
    }

    #[test]
    fn test_parse_empty_config() {
        let config: SaveSyncConfig = toml::from_str("").unwrap();
        assert!(config.items.is_empty());
        assert_eq!(config.scan_interval(), Duration::from_secs(5));
        assert_eq!(config.thresholds.manual(), Duration::from_secs(600));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = SaveSyncConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert!(config.remote.is_empty());
    }

    #[test]
    fn test_load_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "remote = [").unwrap();
        assert!(matches!(
            SaveSyncConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
