//! Daemon configuration
//!
//! Loaded from JSON. Every field has a default so a partial file is enough;
//! with no file at all the built-in configuration describes a small
//! simulated library.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::catalog::MediaType;
use crate::device::{DeviceClass, DeviceState, DriveModel};
use crate::error::{Result, RobotError};
use crate::labels::BarcodeTruncation;
use crate::scsi::block_sizes;
use crate::transport::TransportKind;

const CONFIG_DIR: &str = "sam-robotd";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub eq: u16,
    pub name: String,
    /// Element address in the robot
    pub element: u32,
    pub class: DeviceClass,
    pub model: DriveModel,
    pub shared: bool,
    pub state: DeviceState,
    pub default_blocksize: u32,
    pub max_blocksize: u32,
    pub volsafe: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            eq: 51,
            name: "rmt0".to_string(),
            element: 500,
            class: DeviceClass::Tape,
            model: DriveModel::Generic,
            shared: false,
            state: DeviceState::On,
            default_blocksize: block_sizes::DEFAULT_BLOCK_SIZE,
            max_blocksize: block_sizes::MAX_BLOCK_SIZE,
            volsafe: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub eq: u16,
    pub name: String,
    pub transport: TransportKind,
    pub storage_count: u32,
    pub two_sided: bool,
    /// Element address of the picker
    pub transport_element: u32,
    /// Element address of slot 0
    pub slot_base: u32,
    pub drives: Vec<DriveConfig>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            eq: 50,
            name: "sim-lib".to_string(),
            transport: TransportKind::Simulated,
            storage_count: 10,
            two_sided: false,
            transport_element: 1,
            slot_base: 1000,
            drives: vec![
                DriveConfig::default(),
                DriveConfig {
                    eq: 52,
                    name: "rmt1".to_string(),
                    element: 501,
                    ..Default::default()
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Seconds of inactivity before an idle drive is unloaded, 0 = never
    pub idle_unload: u64,
    /// Same for drives shared with other hosts
    pub shared_unload: u64,
    /// Use the barcode as VSN for unlabeled media
    pub label_barcode: bool,
    pub barcode_truncation: BarcodeTruncation,
    pub autoclean: bool,
    /// `None` follows the transport's own policy
    pub export_expired_cleaners: Option<bool>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            idle_unload: 600,
            shared_unload: 60,
            label_barcode: false,
            barcode_truncation: BarcodeTruncation::Leading,
            autoclean: true,
            export_expired_cleaners: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub idle_poll_ms: u64,
    pub clean_cycle_ms: u64,
    pub clean_unload_retries: u32,
    pub load_retries: u32,
    pub load_backoff_ms: u64,
    pub tur_retries: u32,
    pub tur_interval_ms: u64,
    pub delayed_requeue_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            idle_poll_ms: 10_000,
            clean_cycle_ms: 30_000,
            clean_unload_retries: 7,
            load_retries: 3,
            load_backoff_ms: 5_000,
            tur_retries: 30,
            tur_interval_ms: 2_000,
            delayed_requeue_ms: 10_000,
        }
    }
}

impl Timing {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn clean_cycle(&self) -> Duration {
        Duration::from_millis(self.clean_cycle_ms)
    }

    pub fn load_backoff(&self) -> Duration {
        Duration::from_millis(self.load_backoff_ms)
    }

    pub fn tur_interval(&self) -> Duration {
        Duration::from_millis(self.tur_interval_ms)
    }

    pub fn delayed_requeue(&self) -> Duration {
        Duration::from_millis(self.delayed_requeue_ms)
    }

    /// Millisecond timings for tests
    pub fn fast() -> Self {
        Self {
            idle_poll_ms: 20,
            clean_cycle_ms: 5,
            clean_unload_retries: 3,
            load_retries: 2,
            load_backoff_ms: 1,
            tur_retries: 5,
            tur_interval_ms: 1,
            delayed_requeue_ms: 30,
        }
    }
}

/// A cartridge placed in the simulated library at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryEntry {
    pub slot: u32,
    pub media: MediaType,
    pub barcode: Option<String>,
    /// Label already on the medium; empty for blank media
    pub vsn: String,
    pub cleaning: bool,
    /// Cleaning cycles left
    pub uses: u32,
    pub write_protected: bool,
    /// Units of 1024 bytes
    pub capacity: u64,
}

impl Default for InventoryEntry {
    fn default() -> Self {
        Self {
            slot: 0,
            media: MediaType::Lto,
            barcode: None,
            vsn: String::new(),
            cleaning: false,
            uses: 0,
            write_protected: false,
            capacity: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub library: LibraryConfig,
    pub defaults: Defaults,
    pub timing: Timing,
    pub inventory: Vec<InventoryEntry>,
}

impl Default for RobotConfig {
    fn default() -> Self {
        let mut inventory: Vec<InventoryEntry> = (0..6)
            .map(|slot| InventoryEntry {
                slot,
                barcode: Some(format!("VSN{:03}L6", slot)),
                vsn: if slot < 4 {
                    format!("VSN{:03}", slot)
                } else {
                    String::new()
                },
                ..Default::default()
            })
            .collect();
        inventory.push(InventoryEntry {
            slot: 9,
            barcode: Some("CLN001L1".to_string()),
            cleaning: true,
            uses: 20,
            ..Default::default()
        });

        Self {
            library: LibraryConfig::default(),
            defaults: Defaults::default(),
            timing: Timing::default(),
            inventory,
        }
    }
}

impl RobotConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from `path`, else from the per-user default location, else use
    /// the built-in configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("No configuration file found, using built-in defaults");
                    Self::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let text = fs::read_to_string(path).map_err(|e| {
            RobotError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let lib = &self.library;
        if lib.storage_count == 0 {
            return Err(RobotError::config("library has no storage slots"));
        }
        if lib.drives.is_empty() {
            return Err(RobotError::config("library has no drives"));
        }

        let mut eqs = HashSet::from([lib.eq]);
        let mut elements = HashSet::new();
        for drive in &lib.drives {
            if !eqs.insert(drive.eq) {
                return Err(RobotError::config(format!(
                    "duplicate equipment id {}",
                    drive.eq
                )));
            }
            if !elements.insert(drive.element) {
                return Err(RobotError::config(format!(
                    "drive element {} used twice",
                    drive.element
                )));
            }
            let slot_range = lib.slot_base..lib.slot_base + lib.storage_count;
            if slot_range.contains(&drive.element) || drive.element == lib.transport_element {
                return Err(RobotError::config(format!(
                    "drive element {} collides with the slot or picker range",
                    drive.element
                )));
            }
            if drive.class == DeviceClass::Robot {
                return Err(RobotError::config(format!(
                    "eq {}: a drive cannot have class robot",
                    drive.eq
                )));
            }
            if drive.class == DeviceClass::Tape && drive.max_blocksize < block_sizes::TAPE_SECTOR_SIZE {
                return Err(RobotError::config(format!(
                    "eq {}: max_blocksize {} below {}",
                    drive.eq,
                    drive.max_blocksize,
                    block_sizes::TAPE_SECTOR_SIZE
                )));
            }
        }

        let mut slots = HashSet::new();
        for item in &self.inventory {
            if item.slot >= lib.storage_count {
                return Err(RobotError::config(format!(
                    "inventory slot {} outside 0..{}",
                    item.slot, lib.storage_count
                )));
            }
            if !slots.insert(item.slot) {
                return Err(RobotError::config(format!(
                    "inventory slot {} listed twice",
                    item.slot
                )));
            }
        }

        if self.timing.clean_unload_retries == 0 || self.timing.tur_retries == 0 {
            return Err(RobotError::config("retry counts must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = RobotConfig::default();
        config.validate().unwrap();
        assert_eq!(config.library.drives.len(), 2);
        assert_eq!(config.timing.idle_poll(), Duration::from_secs(10));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("robot").join("config.json");
        let mut config = RobotConfig::default();
        config.defaults.label_barcode = true;
        config.timing = Timing::fast();
        config.save(&path).unwrap();

        let loaded = RobotConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "defaults": { "idle_unload": 5 } }"#).unwrap();
        let loaded = RobotConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.defaults.idle_unload, 5);
        assert_eq!(loaded.library.eq, 50);
    }

    #[test]
    fn test_validate_rejects_collisions() {
        let mut config = RobotConfig::default();
        config.library.drives[1].eq = 51;
        assert!(config.validate().is_err());

        let mut config = RobotConfig::default();
        config.library.drives[1].element = 500;
        assert!(config.validate().is_err());

        let mut config = RobotConfig::default();
        config.library.storage_count = 0;
        assert!(config.validate().is_err());

        let mut config = RobotConfig::default();
        config.inventory[0].slot = 99;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(RobotConfig::load(Some(&dir.path().join("nope.json"))).is_err());
    }
}
