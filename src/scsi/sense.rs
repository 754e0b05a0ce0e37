//! SCSI Sense Data Parsing
//!
//! This module handles parsing and classification of fixed-format sense data
//! returned by drives and changers.

use std::fmt;
use tracing::debug;

use super::constants::{asc, sense_keys};

/// Decoded (sense key, ASC, ASCQ) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

/// How the orchestration layer reacts to a sense triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseClass {
    Ready,
    NotReady,
    BecomingReady,
    UnitAttention,
    NoMedia,
    WriteProtected,
    MediumError,
    BlankCheck,
    CleaningRequested,
    CleaningInProgress,
    Fatal,
}

impl SenseData {
    pub fn new(key: u8, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }

    /// Parse fixed-format sense bytes (key at byte 2, ASC/ASCQ at 12/13)
    pub fn from_bytes(sense_data: &[u8]) -> Option<Self> {
        if sense_data.len() < 3 {
            return None;
        }

        let key = sense_data[2] & 0x0F;
        let asc = if sense_data.len() > 12 {
            sense_data[12]
        } else {
            0
        };
        let ascq = if sense_data.len() > 13 {
            sense_data[13]
        } else {
            0
        };

        debug!(
            "Sense data - Key: 0x{:02X}, ASC: 0x{:02X}, ASCQ: 0x{:02X}",
            key, asc, ascq
        );

        Some(Self { key, asc, ascq })
    }

    /// Encode as 18 bytes of fixed-format sense
    pub fn to_bytes(&self) -> [u8; 18] {
        let mut buf = [0u8; 18];
        buf[0] = 0x70;
        buf[2] = self.key & 0x0F;
        buf[7] = 10;
        buf[12] = self.asc;
        buf[13] = self.ascq;
        buf
    }

    pub fn classify(&self) -> SenseClass {
        match (self.key, self.asc, self.ascq) {
            (sense_keys::NO_SENSE | sense_keys::RECOVERED_ERROR, asc::NO_ADDITIONAL, asc::ASCQ_CLEANING_REQUESTED) => {
                SenseClass::CleaningRequested
            }
            (sense_keys::NO_SENSE, _, _) | (sense_keys::RECOVERED_ERROR, _, _) => SenseClass::Ready,
            (sense_keys::NOT_READY, asc::MEDIUM_NOT_PRESENT, _) => SenseClass::NoMedia,
            (sense_keys::NOT_READY, asc::LOGICAL_UNIT_NOT_READY, asc::ASCQ_BECOMING_READY) => {
                SenseClass::BecomingReady
            }
            (sense_keys::NOT_READY, asc::INCOMPATIBLE_MEDIUM, asc::ASCQ_CLEANING_CARTRIDGE) => {
                SenseClass::CleaningInProgress
            }
            (sense_keys::NOT_READY, asc::LOGICAL_UNIT_NOT_READY, _) => SenseClass::NotReady,
            (sense_keys::NOT_READY, asc::INCOMPATIBLE_MEDIUM, _)
            | (sense_keys::NOT_READY, asc::MEDIUM_FORMAT_CORRUPTED, _) => SenseClass::MediumError,
            (sense_keys::UNIT_ATTENTION, asc::MEDIUM_MAY_HAVE_CHANGED, _)
            | (sense_keys::UNIT_ATTENTION, asc::POWER_ON_RESET, _) => SenseClass::UnitAttention,
            (sense_keys::DATA_PROTECT, _, _) => SenseClass::WriteProtected,
            (sense_keys::BLANK_CHECK, _, _) => SenseClass::BlankCheck,
            (sense_keys::MEDIUM_ERROR, _, _) => SenseClass::MediumError,
            _ => SenseClass::Fatal,
        }
    }

    /// Human readable interpretation, used in operator messages
    pub fn description(&self) -> String {
        match (self.key, self.asc, self.ascq) {
            (0x00, 0x00, 0x17) | (0x01, 0x00, 0x17) => "Drive requests cleaning".to_string(),
            (0x00, _, _) => "Device ready".to_string(),
            (0x02, 0x3A, 0x00) => "No tape loaded".to_string(),
            (0x02, 0x04, 0x01) => "Drive not ready - becoming ready".to_string(),
            (0x02, 0x04, _) => "Drive not ready".to_string(),
            (0x02, 0x30, 0x03) => "Cleaning cartridge installed".to_string(),
            (0x02, 0x3B, 0x0D) => "Medium not present".to_string(),
            (0x05, 0x3B, 0x0D) => "Medium destination element full".to_string(),
            (0x05, 0x3B, 0x0E) => "Medium source element empty".to_string(),
            (0x06, 0x28, 0x00) => "Unit attention - not ready to ready transition".to_string(),
            (0x06, 0x29, _) => "Unit attention - power on or reset".to_string(),
            (0x07, _, _) => "Write protected".to_string(),
            (0x08, _, _) => "Blank check".to_string(),
            (0x03, _, _) => format!(
                "Medium error - ASC/ASCQ: 0x{:02X}/0x{:02X}",
                self.asc, self.ascq
            ),
            _ => format!(
                "Sense Key: 0x{:02X}, ASC/ASCQ: 0x{:02X}/0x{:02X}",
                self.key, self.asc, self.ascq
            ),
        }
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:02X}/{:02X}/{:02X}]",
            self.description(),
            self.key,
            self.asc,
            self.ascq
        )
    }
}

impl SenseClass {
    /// Conditions worth another TUR after a short sleep
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SenseClass::NotReady | SenseClass::BecomingReady | SenseClass::UnitAttention
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            SenseClass::Ready => "ready",
            SenseClass::NotReady => "not ready",
            SenseClass::BecomingReady => "becoming ready",
            SenseClass::UnitAttention => "unit attention",
            SenseClass::NoMedia => "no media",
            SenseClass::WriteProtected => "write protected",
            SenseClass::MediumError => "medium error",
            SenseClass::BlankCheck => "blank check",
            SenseClass::CleaningRequested => "cleaning requested",
            SenseClass::CleaningInProgress => "cleaning in progress",
            SenseClass::Fatal => "fatal",
        }
    }
}
