//! Media transport: moving cartridges between slots and drives
//!
//! The robot-specific part of a library sits behind [`MediaTransport`]. The
//! implementation is chosen once, when the library is configured.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::{Defaults, LibraryConfig, Timing};
use crate::error::{Result, RobotError};
use crate::scsi::{asc, sense_keys, SenseData};
use crate::sim::{SimChanger, SimRobot, SimWorld};

pub mod generic;

pub use generic::{CommandChannel, GenericScsiTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// SCSI medium changer driven with MOVE MEDIUM
    GenericScsi,
    Ibm3494,
    StkAcsls,
    Grau,
    #[default]
    Simulated,
}

impl TransportKind {
    /// Vendor libraries driven through a network API rather than SCSI
    pub fn is_api(&self) -> bool {
        matches!(
            self,
            TransportKind::Ibm3494 | TransportKind::StkAcsls | TransportKind::Grau
        )
    }

    /// Expired cleaning cartridges stay in the library; the vendor software
    /// manages them
    pub fn keeps_expired_cleaners(&self) -> bool {
        matches!(self, TransportKind::Ibm3494)
    }

    /// Cleaning parameters for this kind of robot. The configured
    /// `export_expired_cleaners` overrides the vendor default.
    pub fn clean_policy(&self, timing: &Timing, defaults: &Defaults) -> CleanPolicy {
        CleanPolicy {
            load_attempts: if self.is_api() { timing.load_retries.max(1) } else { 1 },
            load_backoff: timing.load_backoff(),
            cycle: timing.clean_cycle(),
            unload_attempts: timing.clean_unload_retries.max(1),
            export_expired: defaults
                .export_expired_cleaners
                .unwrap_or(!self.keeps_expired_cleaners()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::GenericScsi => "generic-scsi",
            TransportKind::Ibm3494 => "ibm3494",
            TransportKind::StkAcsls => "stk-acsls",
            TransportKind::Grau => "grau",
            TransportKind::Simulated => "simulated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanPolicy {
    pub load_attempts: u32,
    pub load_backoff: Duration,
    /// Time the cleaning cartridge is left in the drive before each unload attempt
    pub cycle: Duration,
    pub unload_attempts: u32,
    pub export_expired: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoveError {
    /// Move completed after a recovered error; the medium may be anywhere
    #[error("move recovered by robot")]
    Recovered,

    #[error("incompatible medium")]
    Incompatible,

    #[error("source element empty")]
    SourceEmpty,

    #[error("destination element full")]
    DestinationFull,

    #[error("move failed: {0}")]
    Failed(String),
}

impl MoveError {
    pub fn from_sense(sense: &SenseData) -> Self {
        match (sense.key, sense.asc, sense.ascq) {
            (sense_keys::RECOVERED_ERROR, _, _) => MoveError::Recovered,
            (_, asc::INCOMPATIBLE_MEDIUM, _) => MoveError::Incompatible,
            (_, asc::MEDIUM_SOURCE_ELEMENT, asc::ASCQ_SOURCE_EMPTY) => MoveError::SourceEmpty,
            (_, asc::MEDIUM_SOURCE_ELEMENT, asc::ASCQ_DESTINATION_FULL) => {
                MoveError::DestinationFull
            }
            _ => MoveError::Failed(sense.to_string()),
        }
    }

    /// The medium stayed where it was and is still good
    pub fn restores_occupied(&self) -> bool {
        matches!(self, MoveError::Recovered | MoveError::Incompatible)
    }
}

/// What the robot reports about one drive element
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveQuery {
    pub element: u32,
    pub full: bool,
    /// Element the medium came from, when the robot remembers it
    pub source: Option<u32>,
    pub barcode: Option<String>,
    pub invert: bool,
}

pub trait MediaTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Move the medium at `src` to `dst`, turning it over when `invert`
    fn move_media(&self, transport: u32, src: u32, dst: u32, invert: bool)
        -> std::result::Result<(), MoveError>;

    fn query_drive(&self, element: u32) -> std::result::Result<DriveQuery, MoveError>;

    fn query_all_drives(&self) -> std::result::Result<Vec<DriveQuery>, MoveError>;
}

/// Select the transport for a library.
///
/// The simulated robot and the generic SCSI changer (issuing its commands
/// to the simulated changer) are available; vendor API clients are not
/// linked into this build.
pub fn open_transport(
    config: &LibraryConfig,
    world: Option<Arc<SimWorld>>,
) -> Result<Arc<dyn MediaTransport>> {
    let need_world = || {
        world.clone().ok_or_else(|| {
            RobotError::config(format!(
                "library {}: {} transport needs a device channel",
                config.eq,
                config.transport.name()
            ))
        })
    };

    let transport: Arc<dyn MediaTransport> = match config.transport {
        TransportKind::Simulated => Arc::new(SimRobot::new(need_world()?)),
        TransportKind::GenericScsi => {
            let drives = config.drives.iter().map(|d| d.element).collect();
            let channel = Arc::new(SimChanger::new(need_world()?));
            Arc::new(GenericScsiTransport::new(channel, drives))
        }
        kind => {
            return Err(RobotError::config(format!(
                "library {}: no {} client available",
                config.eq,
                kind.name()
            )))
        }
    };

    info!(
        "library {}: using {} transport",
        config.eq,
        transport.kind().name()
    );
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_policy() {
        assert!(TransportKind::StkAcsls.is_api());
        assert!(!TransportKind::GenericScsi.is_api());
        assert!(TransportKind::Ibm3494.keeps_expired_cleaners());
        assert!(!TransportKind::Grau.keeps_expired_cleaners());
    }

    #[test]
    fn test_clean_policy() {
        let timing = Timing::default();
        let mut defaults = Defaults::default();
        let scsi = TransportKind::GenericScsi.clean_policy(&timing, &defaults);
        assert_eq!(scsi.load_attempts, 1);
        assert!(scsi.export_expired);

        let ibm = TransportKind::Ibm3494.clean_policy(&timing, &defaults);
        assert_eq!(ibm.load_attempts, timing.load_retries);
        assert!(!ibm.export_expired);

        defaults.export_expired_cleaners = Some(true);
        assert!(TransportKind::Ibm3494.clean_policy(&timing, &defaults).export_expired);
    }

    #[test]
    fn test_move_error_from_sense() {
        assert_eq!(
            MoveError::from_sense(&SenseData::new(0x05, 0x3B, 0x0E)),
            MoveError::SourceEmpty
        );
        assert_eq!(
            MoveError::from_sense(&SenseData::new(0x05, 0x3B, 0x0D)),
            MoveError::DestinationFull
        );
        assert_eq!(
            MoveError::from_sense(&SenseData::new(0x02, 0x30, 0x00)),
            MoveError::Incompatible
        );
        assert_eq!(
            MoveError::from_sense(&SenseData::new(0x01, 0x00, 0x00)),
            MoveError::Recovered
        );
        assert!(matches!(
            MoveError::from_sense(&SenseData::new(0x04, 0x40, 0x00)),
            MoveError::Failed(_)
        ));
    }

    #[test]
    fn test_open_transport_kinds() {
        let mut config = LibraryConfig::default();
        assert!(open_transport(&config, None).is_err());
        let world = SimWorld::new();
        assert_eq!(
            open_transport(&config, Some(world.clone())).unwrap().kind(),
            TransportKind::Simulated
        );
        config.transport = TransportKind::GenericScsi;
        assert_eq!(
            open_transport(&config, Some(world.clone())).unwrap().kind(),
            TransportKind::GenericScsi
        );
        config.transport = TransportKind::StkAcsls;
        assert!(open_transport(&config, Some(world)).is_err());
    }
}
