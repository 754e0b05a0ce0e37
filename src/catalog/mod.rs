//! Media catalog interface
//!
//! The catalog is the durable record of what sits in every storage slot.
//! The orchestration core only talks to it through [`Catalog`], treating
//! each call as an atomic remote operation keyed by (robot eq, slot,
//! partition) or (media type, VSN).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod memory;

pub use memory::MemoryCatalog;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct CeStatus: u32 {
        const INUSE = 1 << 0;
        const OCCUPIED = 1 << 1;
        const BAR_CODE = 1 << 2;
        const READ_ONLY = 1 << 3;
        const WRITE_PROTECT = 1 << 4;
        const NON_SAM = 1 << 5;
        const NEEDS_AUDIT = 1 << 6;
        const CLEANING = 1 << 7;
        const BAD_MEDIA = 1 << 8;
        const LABELED = 1 << 9;
        const UNAVAIL = 1 << 10;
        const EXPORT = 1 << 11;
    }
}

/// Media types known to the catalog, with their two-letter mnemonics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Lto,
    Dlt,
    Ibm3570,
    Stk9840,
    SonyDtf,
    MagnetoOptical,
    Worm,
}

impl MediaType {
    pub fn from_mnemonic(code: &str) -> Option<Self> {
        match code {
            "li" => Some(MediaType::Lto),
            "lt" => Some(MediaType::Dlt),
            "i7" => Some(MediaType::Ibm3570),
            "sg" => Some(MediaType::Stk9840),
            "so" => Some(MediaType::SonyDtf),
            "mo" => Some(MediaType::MagnetoOptical),
            "wo" => Some(MediaType::Worm),
            _ => None,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            MediaType::Lto => "li",
            MediaType::Dlt => "lt",
            MediaType::Ibm3570 => "i7",
            MediaType::Stk9840 => "sg",
            MediaType::SonyDtf => "so",
            MediaType::MagnetoOptical => "mo",
            MediaType::Worm => "wo",
        }
    }

    pub fn is_tape(&self) -> bool {
        !matches!(self, MediaType::MagnetoOptical | MediaType::Worm)
    }

    pub fn is_worm(&self) -> bool {
        matches!(self, MediaType::Worm)
    }
}

/// Per-slot metadata, consumed by value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub eq: u16,
    pub slot: u32,
    pub partition: u8,
    pub vsn: String,
    pub media: MediaType,
    pub status: CeStatus,
    /// Remaining uses for cleaning cartridges, mount count otherwise
    pub access: u32,
    pub space: u64,
    pub capacity: u64,
    pub barcode: String,
    pub label_time: u32,
    pub mount_time: i64,
    /// Optical: first sector of the PTOC; 0 means never written
    pub ptoc_fwa: u32,
    pub last_pos: u64,
}

impl CatalogEntry {
    pub fn has(&self, bits: CeStatus) -> bool {
        self.status.intersects(bits)
    }

    pub fn has_barcode(&self) -> bool {
        self.status.contains(CeStatus::BAR_CODE) && !self.barcode.trim().is_empty()
    }
}

/// Single-field setters
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogField {
    Access(u32),
    MountTime(i64),
    Vsn(String),
    Space(u64),
    Capacity(u64),
    LabelTime(u32),
    Media(MediaType),
    LastPos(u64),
}

/// Why a unit snapshot is being pushed to the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateReason {
    VolumeLoaded,
    VolumeUnloaded,
    LabelComplete,
    Audit,
}

/// Volume state as observed by a drive, pushed through `Catalog::update`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeInfo {
    pub eq: u16,
    pub slot: u32,
    pub partition: u8,
    pub media: Option<MediaType>,
    pub vsn: String,
    pub labeled: bool,
    pub read_only: bool,
    pub write_protect: bool,
    pub bad_media: bool,
    pub space: u64,
    pub capacity: u64,
    pub label_time: u32,
    pub position: u64,
}

pub trait Catalog: Send + Sync {
    fn get_by_loc(&self, eq: u16, slot: u32, partition: u8) -> Option<CatalogEntry>;

    fn get_by_media(&self, media: MediaType, vsn: &str) -> Option<CatalogEntry>;

    /// Set (`on`) or clear status bits of one slot
    fn set_status(&self, eq: u16, slot: u32, partition: u8, bits: CeStatus, on: bool)
        -> Result<()>;

    fn set_field(&self, eq: u16, slot: u32, partition: u8, field: CatalogField) -> Result<()>;

    /// Reserve `vsn` for a label in progress. Fails if the VSN is taken.
    fn label_volume(
        &self,
        eq: u16,
        slot: u32,
        partition: u8,
        media: MediaType,
        vsn: &str,
    ) -> Result<()>;

    /// Drop the reservation made by `label_volume`
    fn label_failed(&self, eq: u16, slot: u32, partition: u8, vsn: &str);

    fn update(&self, info: &VolumeInfo, reason: UpdateReason) -> Result<()>;

    /// A usable cleaning cartridge in library `eq`
    fn get_cleaning_volume(&self, eq: u16) -> Option<CatalogEntry>;

    fn schedule_export(&self, eq: u16, slot: u32) -> Result<()>;

    fn entries(&self, eq: u16) -> Vec<CatalogEntry>;
}
