//! Configuration file support for urclock.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (URCLOCK_*)
//! 3. Local config file (./urclock.toml)
//! 4. Global config file (~/.config/urclock/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the config file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "urclock.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Extra milliseconds to wait after the reset pulse.
    pub delay: Option<i64>,
    /// Whether to pulse DTR/RTS before syncing.
    pub autoreset: Option<bool>,
}

/// Upload configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadConfig {
    /// Part name for bootloaders that do not identify the part.
    pub part: Option<String>,
    /// Bootloader size in bytes.
    pub bootsize: Option<u32>,
    /// Vector bootloader vector number.
    pub vectornum: Option<i32>,
    /// Record no date or filename in the metadata.
    #[serde(default)]
    pub nodate: bool,
    /// Record no filename in the metadata.
    #[serde(default)]
    pub nofilename: bool,
    /// Write no metadata at all.
    #[serde(default)]
    pub nometadata: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Upload configuration.
    #[serde(default)]
    pub upload: UploadConfig,
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
        ProjectDirs::from("", "", "urclock").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values win.
    fn merge(&mut self, other: Self) {
        let conn = other.connection;
        if conn.port.is_some() {
            self.connection.port = conn.port;
        }
        if conn.baud.is_some() {
            self.connection.baud = conn.baud;
        }
        if conn.delay.is_some() {
            self.connection.delay = conn.delay;
        }
        if conn.autoreset.is_some() {
            self.connection.autoreset = conn.autoreset;
        }

        let upload = other.upload;
        if upload.part.is_some() {
            self.upload.part = upload.part;
        }
        if upload.bootsize.is_some() {
            self.upload.bootsize = upload.bootsize;
        }
        if upload.vectornum.is_some() {
            self.upload.vectornum = upload.vectornum;
        }
        self.upload.nodate |= upload.nodate;
        self.upload.nofilename |= upload.nofilename;
        self.upload.nometadata |= upload.nometadata;
    }
}
