//! Configuration for the Almanac settings daemon

use almanac_core::RegistryOptions;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlmanacConfig {
    /// Settings file handling
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Settings file name inside the data directory
    #[serde(default = "default_file_name")]
    pub file_name: String,

    /// Debounce window for saves in milliseconds (0 = save immediately)
    #[serde(default = "default_save_delay")]
    pub save_delay_ms: u64,

    /// Directories with factory default overlays
    #[serde(default = "default_defaults_dirs")]
    pub defaults_dirs: Vec<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            file_name: default_file_name(),
            save_delay_ms: default_save_delay(),
            defaults_dirs: default_defaults_dirs(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_file_name() -> String {
    "settings.xml".to_string()
}

fn default_save_delay() -> u64 {
    2000
}

fn default_defaults_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/etc/almanac/settings.d")]
}

pub fn default_socket_path() -> String {
    "/run/almanac/almanac.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AlmanacConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_yaml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Registry options for the settings stored under `data_dir`
    pub fn registry_options(&self, data_dir: &Path) -> RegistryOptions {
        RegistryOptions {
            data_dir: data_dir.to_path_buf(),
            file_name: self.persistence.file_name.clone(),
            save_delay: Duration::from_millis(self.persistence.save_delay_ms),
            defaults_dirs: self.persistence.defaults_dirs.clone(),
        }
    }
}
