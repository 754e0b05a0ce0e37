//! Media label codecs and writers
//!
//! - `tape`: ANSI VOL1/HDR1/HDR2 records
//! - `optical`: ANSI primary volume / partition descriptors

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RobotError;

pub mod optical;
pub mod tape;

pub use optical::{
    upd_part_label, upd_vol_label, vfyansi_label, write_labels, PartitionDescriptor,
    PrimaryVolumeDescriptor, PARTITION_DES, PRIMARY_VOL_DES,
};
pub use tape::{clamp_block_size, write_tape_labels, AnsiDate, TapeLabels};

/// Maximum VSN lengths
pub const LEN_TAPE_VSN: usize = 6;
pub const LEN_OPTIC_VSN: usize = 31;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct LabelFlags: u32 {
        /// Long erase before writing labels
        const ERASE = 1 << 0;
        /// Overwrite an existing label
        const RELABEL = 1 << 1;
        /// Take the VSN from the cartridge barcode
        const BARCODE = 1 << 2;
    }
}

/// Input to the label writers
#[derive(Debug, Clone, Default)]
pub struct LabelParams {
    pub vsn: String,
    pub info: Option<String>,
    /// Requested tape block size, 0 for the drive default
    pub block_size: u32,
    pub flags: LabelFlags,
}

impl LabelParams {
    pub fn new(vsn: &str) -> Self {
        Self {
            vsn: vsn.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    /// Write-once VOLSAFE media refused the relabel. Not a drive or media fault.
    #[error("attempt to relabel VOLSAFE media")]
    Volsafe,

    #[error("rewind failed: {0}")]
    Rewind(String),

    #[error("erase failed: {0}")]
    Erase(String),

    #[error("drive not ready: {0}")]
    NotReady(String),

    #[error("unable to reopen for labels: {0}")]
    Reopen(String),

    #[error("label write failed after {written} records")]
    Write { written: usize },

    #[error("unable to write end of data: {0}")]
    Eod(String),

    #[error("cannot read old labels: {0}")]
    ReadOld(String),

    #[error("cannot update label: {0}")]
    CannotUpdate(String),

    #[error("malformed label: {0}")]
    Malformed(String),
}

impl LabelError {
    /// Soft errors leave both drive and medium usable
    pub fn is_soft(&self) -> bool {
        matches!(self, LabelError::Volsafe)
    }
}

impl From<LabelError> for RobotError {
    fn from(err: LabelError) -> Self {
        RobotError::Label(err.to_string())
    }
}

/// Which end of an over-long barcode becomes the VSN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarcodeTruncation {
    /// Keep the first characters
    #[default]
    Leading,
    /// Keep the last characters
    Trailing,
}

/// Derive a VSN from a cartridge barcode.
///
/// Blanks are trimmed and the result is cut to `max_len` characters
/// (6 for tape, 31 for optical) from the configured end.
pub fn vsn_from_barcode(barcode: &str, truncation: BarcodeTruncation, max_len: usize) -> String {
    let chars: Vec<char> = barcode.trim().chars().filter(|c| !c.is_control()).collect();
    if chars.len() <= max_len {
        return chars.into_iter().collect();
    }

    match truncation {
        BarcodeTruncation::Leading => chars[..max_len].iter().collect(),
        BarcodeTruncation::Trailing => chars[chars.len() - max_len..].iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vsn_from_barcode_short() {
        assert_eq!(
            vsn_from_barcode("  ABC12 ", BarcodeTruncation::Leading, LEN_TAPE_VSN),
            "ABC12"
        );
    }

    #[test]
    fn test_vsn_from_barcode_truncation() {
        assert_eq!(
            vsn_from_barcode("000123L6", BarcodeTruncation::Leading, LEN_TAPE_VSN),
            "000123"
        );
        assert_eq!(
            vsn_from_barcode("CLN001L1", BarcodeTruncation::Trailing, LEN_TAPE_VSN),
            "N001L1"
        );
        let long = "X".repeat(40);
        assert_eq!(
            vsn_from_barcode(&long, BarcodeTruncation::Leading, LEN_OPTIC_VSN).len(),
            31
        );
    }

    #[test]
    fn test_volsafe_is_soft() {
        assert!(LabelError::Volsafe.is_soft());
        assert!(!LabelError::Write { written: 1 }.is_soft());
    }
}
