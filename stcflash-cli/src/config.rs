//! Configuration file support for stcflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (STCFLASH_*)
//! 3. Local config file (./stcflash.toml)
//! 4. Global config file (~/.config/stcflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-project config file.
pub const LOCAL_CONFIG: &str = "stcflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Baud rate used for discovery.
    pub low_baud: Option<u32>,
}

/// Programming configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Protocol name: auto, 89, 12c5a, 12c52 or 12cx052.
    pub protocol: Option<String>,
    /// Erase the data EEPROM on the next download.
    pub erase_eeprom: Option<bool>,
}

/// Auto-ISP configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoIspConfig {
    /// Baud rate the magic sequence is sent at.
    pub baud: Option<u32>,
    /// Magic sequence that resets the target into its boot loader.
    pub magic: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Programming configuration.
    #[serde(default)]
    pub program: ProgramConfig,
    /// Auto-ISP configuration.
    #[serde(default)]
    pub autoisp: AutoIspConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "stcflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.low_baud.is_some() {
            self.connection.low_baud = other.connection.low_baud;
        }

        if other.program.protocol.is_some() {
            self.program.protocol = other.program.protocol;
        }
        if other.program.erase_eeprom.is_some() {
            self.program.erase_eeprom = other.program.erase_eeprom;
        }

        if other.autoisp.baud.is_some() {
            self.autoisp.baud = other.autoisp.baud;
        }
        if other.autoisp.magic.is_some() {
            self.autoisp.magic = other.autoisp.magic;
        }
    }
}
