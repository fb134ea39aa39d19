//! Configuration file support for gigaflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (GIGAFLASH_*)
//! 3. Local config file (./gigaflash.toml)
//! 4. Global config file (~/.config/gigaflash/config.toml)

use directories::ProjectDirs;
use gigaflash::{BoardIdentity, DfuUtil, Timing};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG: &str = "gigaflash.toml";

/// Firmware directory used when nothing else is configured.
pub const DEFAULT_FIRMWARE_DIR: &str = "firmware";

/// Board identification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Substring of the USB product string.
    pub product: Option<String>,
    /// Substring of the USB manufacturer string.
    pub manufacturer: Option<String>,
    /// Preferred serial port.
    pub port: Option<String>,
}

/// Flash tool and firmware locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Directory holding `firmwareM7.bin` and `firmwareM4_<target>.bin`.
    pub firmware_dir: Option<PathBuf>,
    /// `dfu-util` executable.
    pub dfu_util: Option<String>,
    /// Staging file handed to `dfu-util`.
    pub staging_file: Option<PathBuf>,
}

/// Polling parameters, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait for the board to leave application mode.
    pub bootloader_timeout_ms: Option<u64>,
    /// Wait for the board to boot after a write.
    pub boot_timeout_ms: Option<u64>,
    /// Pause before running the flash tool.
    pub settle_ms: Option<u64>,
    /// Pause after the board boots, before validation.
    pub boot_settle_ms: Option<u64>,
    /// First polling interval.
    pub poll_interval_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Board identification.
    #[serde(default)]
    pub board: BoardConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Timing configuration.
    #[serde(default)]
    pub timing: TimingConfig,
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
        ProjectDirs::from("", "", "gigaflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.board.product, other.board.product);
        take(&mut self.board.manufacturer, other.board.manufacturer);
        take(&mut self.board.port, other.board.port);

        take(&mut self.flash.firmware_dir, other.flash.firmware_dir);
        take(&mut self.flash.dfu_util, other.flash.dfu_util);
        take(&mut self.flash.staging_file, other.flash.staging_file);

        take(
            &mut self.timing.bootloader_timeout_ms,
            other.timing.bootloader_timeout_ms,
        );
        take(&mut self.timing.boot_timeout_ms, other.timing.boot_timeout_ms);
        take(&mut self.timing.settle_ms, other.timing.settle_ms);
        take(&mut self.timing.boot_settle_ms, other.timing.boot_settle_ms);
        take(&mut self.timing.poll_interval_ms, other.timing.poll_interval_ms);
    }

    /// Board identity, falling back to the built-in defaults.
    pub fn identity(&self) -> BoardIdentity {
        let defaults = BoardIdentity::default();
        BoardIdentity::new(
            self.board
                .product
                .clone()
                .unwrap_or(defaults.product),
            self.board
                .manufacturer
                .clone()
                .unwrap_or(defaults.manufacturer),
        )
    }

    /// Firmware directory.
    pub fn firmware_dir(&self) -> PathBuf {
        self.flash
            .firmware_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FIRMWARE_DIR))
    }

    /// Staging file for `dfu-util`.
    pub fn staging_file(&self) -> PathBuf {
        self.flash
            .staging_file
            .clone()
            .unwrap_or_else(DfuUtil::default_staging)
    }

    /// Polling parameters with defaults filled in.
    pub fn timing(&self) -> Timing {
        let defaults = Timing::default();
        let ms = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_millis);
        Timing {
            bootloader_timeout: ms(self.timing.bootloader_timeout_ms, defaults.bootloader_timeout),
            boot_timeout: ms(self.timing.boot_timeout_ms, defaults.boot_timeout),
            settle: ms(self.timing.settle_ms, defaults.settle),
            boot_settle: ms(self.timing.boot_settle_ms, defaults.boot_settle),
            poll_interval: ms(self.timing.poll_interval_ms, defaults.poll_interval),
        }
    }
}
