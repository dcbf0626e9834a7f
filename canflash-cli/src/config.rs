//! Configuration file support for canflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (CANFLASH_*)
//! 3. Local config file (./canflash.toml)
//! 4. Global config file (~/.config/canflash/config.toml)

use canflash::DeviceFamily;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "canflash.toml";

/// Bus adapter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    /// SLCAN adapter serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// CAN bitrate in bit/s.
    pub bitrate: Option<u32>,
    /// Bootloader family ("standard" or "legacy").
    pub family: Option<DeviceFamily>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Attempts per page before a flash is abandoned.
    pub page_retries: Option<u32>,
    /// Whole-flash attempts.
    pub attempts: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Bus configuration.
    #[serde(default)]
    pub bus: BusConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
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
        ProjectDirs::from("", "", "canflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.bus.port.is_some() {
            self.bus.port = other.bus.port;
        }
        if other.bus.bitrate.is_some() {
            self.bus.bitrate = other.bus.bitrate;
        }
        if other.bus.family.is_some() {
            self.bus.family = other.bus.family;
        }

        if other.flash.page_retries.is_some() {
            self.flash.page_retries = other.flash.page_retries;
        }
        if other.flash.attempts.is_some() {
            self.flash.attempts = other.flash.attempts;
        }
    }
}
