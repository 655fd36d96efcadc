//! Configuration file management
//!
//! Loads TOML configuration files and provides display manager settings.
//! Default config path: ~/.config/kmsdm/config.toml

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{PREFERRED_PRIMARY_NODE, PREFERRED_VENDOR_ID};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GPU device selection
    pub device: DeviceConfig,
    /// Hotplug monitor settings
    pub hotplug: HotplugConfig,
    /// Client notification settings
    pub notify: NotifyConfig,
    /// Display plane reservation
    pub planes: PlaneConfig,
    /// Explicit synchronization settings
    pub sync: SyncConfig,
}

/// GPU device selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Index into the enumerated device list used when no device
    /// matches the preferred node and vendor (out of range falls back to 0)
    pub preferred_index: usize,
    /// Primary node expected to drive the display
    pub primary_node: String,
    /// PCI vendor id of the target hardware family
    pub vendor_id: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            preferred_index: 0,
            primary_node: PREFERRED_PRIMARY_NODE.to_string(),
            vendor_id: PREFERRED_VENDOR_ID,
        }
    }
}

/// Hotplug monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotplugConfig {
    /// Listen for kernel uevents (false = static display set)
    pub enabled: bool,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// When displays are told about their own connection status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyPolicy {
    /// Notify every display after every reconciliation pass
    #[default]
    Always,
    /// Stay quiet until the first notification round, unless
    /// the first display lost its connection
    Reduced,
}

/// Client notification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub policy: NotifyPolicy,
}

/// Planes reserved for one display
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneReservation {
    /// Pipeline index of the display
    pub display: usize,
    /// Plane ids the display keeps exclusively
    pub planes: Vec<u32>,
}

/// Display plane reservation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneConfig {
    /// Platform reserves planes per display
    pub reserve: bool,
    /// Per-display reservations
    pub reserved: Vec<PlaneReservation>,
}

impl PlaneConfig {
    /// Reserved plane ids for a display (empty if none configured)
    pub fn reserved_planes(&self, display: usize) -> &[u32] {
        self.reserved
            .iter()
            .find(|r| r.display == display)
            .map(|r| r.planes.as_slice())
            .unwrap_or(&[])
    }
}

/// Explicit synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Produce native fences for render/blit completion
    /// When false, every fence is "none" (already complete)
    pub native_fences: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            native_fences: true,
        }
    }
}

impl Config {
    /// System-wide config path
    pub const SYSTEM_CONFIG_PATH: &'static str = "/etc/kmsdm/config.toml";

    /// Get config file path
    ///
    /// Search order:
    /// 1. KMSDM_CONFIG environment variable
    /// 2. ~/.config/kmsdm/config.toml
    /// 3. /etc/kmsdm/config.toml
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("KMSDM_CONFIG") {
            let p = std::path::Path::new(&path);
            if p.exists() {
                return Some(p.to_path_buf());
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("kmsdm").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }
        }

        let system_config = std::path::Path::new(Self::SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            return Some(system_config.to_path_buf());
        }

        None
    }

    /// Load settings (use defaults if file doesn't exist or fails to parse)
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    info!("Loaded config: {}", path.display());
                    return config;
                }
                Err(e) => {
                    warn!("Failed to load config {}: {:#}", path.display(), e);
                }
            }
        }
        info!("Using built-in default config");
        Self::default()
    }

    /// Load settings from specified path
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
