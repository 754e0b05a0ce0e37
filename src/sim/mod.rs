//! In-memory robot world
//!
//! A `SimWorld` holds every element (slots and drives) of a simulated
//! library together with the cartridges in them. [`SimRobot`] and
//! [`SimChanger`] move cartridges around, [`SimDrive`] reads and writes the
//! cartridge in its element. Faults can be injected through `faults()`.

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::catalog::{CatalogEntry, CeStatus, MediaType, MemoryCatalog};
use crate::config::{InventoryEntry, RobotConfig};
use crate::labels::{LabelParams, PartitionDescriptor, PrimaryVolumeDescriptor, TapeLabels};
use crate::scsi::block_sizes;
use crate::transport::{DriveQuery, MoveError};

mod drive;
mod robot;

pub use drive::SimDrive;
pub use robot::{SimChanger, SimRobot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapeBlock {
    Data(Vec<u8>),
    Filemark,
}

#[derive(Debug, Clone)]
pub struct SimMedium {
    pub media: MediaType,
    pub barcode: Option<String>,
    pub records: Vec<TapeBlock>,
    pub sectors: BTreeMap<u32, Vec<u8>>,
    pub sector_size: usize,
    pub worm: bool,
    pub write_protected: bool,
    pub cleaning: bool,
    /// TUR polls answered with "cleaning in progress" before the cycle ends
    pub cleaning_polls: u32,
    /// Units of 1024 bytes (tape) or sectors (optical)
    pub capacity: u64,
    pub bad: bool,
    /// Side B of two-sided media
    pub other_side: Option<Box<SimMedium>>,
}

impl SimMedium {
    fn blank(media: MediaType, capacity: u64) -> Self {
        Self {
            media,
            barcode: None,
            records: Vec::new(),
            sectors: BTreeMap::new(),
            sector_size: block_sizes::OPTICAL_SECTOR_SIZE as usize,
            worm: media.is_worm(),
            write_protected: false,
            cleaning: false,
            cleaning_polls: 0,
            capacity,
            bad: false,
            other_side: None,
        }
    }

    /// A tape, pre-labeled with `vsn` unless it is empty
    pub fn tape(vsn: &str, media: MediaType, capacity: u64) -> Self {
        let mut medium = Self::blank(media, capacity);
        if !vsn.is_empty() {
            let labels = TapeLabels::build(
                &LabelParams::new(vsn),
                block_sizes::DEFAULT_BLOCK_SIZE,
                &chrono::Utc::now(),
            );
            for record in labels.records() {
                medium.records.push(TapeBlock::Data(record.to_vec()));
            }
            medium.records.push(TapeBlock::Filemark);
        }
        medium
    }

    /// An optical platter of `total_sectors`, labeled with `vsn` unless empty
    pub fn optical(vsn: &str, media: MediaType, total_sectors: u64) -> Self {
        let mut medium = Self::blank(media, total_sectors);
        if !vsn.is_empty() {
            let now = chrono::Utc::now();
            let mut vol = PrimaryVolumeDescriptor::new(vsn, None, &now).to_bytes();
            let mut par = PartitionDescriptor::new(total_sectors as u32, None).to_bytes();
            vol.resize(medium.sector_size, 0);
            par.resize(medium.sector_size, 0);
            medium.sectors.insert(0, vol);
            medium.sectors.insert(1, par);
        }
        medium
    }

    pub fn cleaning(barcode: &str) -> Self {
        let mut medium = Self::blank(MediaType::Lto, 0);
        medium.barcode = Some(barcode.to_string());
        medium.cleaning = true;
        medium
    }

    pub fn with_barcode(mut self, barcode: &str) -> Self {
        self.barcode = Some(barcode.to_string());
        self
    }

    pub fn with_other_side(mut self, side_b: SimMedium) -> Self {
        self.other_side = Some(Box::new(side_b));
        self
    }

    /// Turn the platter over
    pub fn flip(&mut self) {
        if let Some(mut other) = self.other_side.take() {
            std::mem::swap(self, &mut other);
            self.other_side = Some(other);
        }
    }

    fn from_inventory(item: &InventoryEntry) -> Self {
        let mut medium = if item.cleaning {
            let mut m = Self::cleaning(item.barcode.as_deref().unwrap_or(""));
            m.media = item.media;
            m
        } else if item.media.is_tape() {
            Self::tape(&item.vsn, item.media, item.capacity)
        } else {
            Self::optical(&item.vsn, item.media, item.capacity)
        };
        medium.barcode = item.barcode.clone();
        medium.write_protected = item.write_protected;
        medium
    }
}

/// Injected failures, consumed as they fire
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Fail this many moves with `move_error`
    pub move_failures: u32,
    pub move_error: Option<MoveError>,
    /// Fail this many moves out of a drive
    pub unload_failures: u32,
    /// Answer this many TURs with "becoming ready"
    pub tur_not_ready: u32,
    /// Drive elements whose next TUR asks for cleaning
    pub request_cleaning: HashSet<u32>,
    pub erase_fails: bool,
    /// Refuse this many device opens
    pub open_failures: u32,
}

#[derive(Default)]
struct WorldState {
    elements: BTreeMap<u32, Option<SimMedium>>,
    drives: HashSet<u32>,
    sources: HashMap<u32, (u32, bool)>,
    positions: HashMap<u32, usize>,
    faults: Faults,
    moves: Vec<(u32, u32, bool)>,
    erases: HashMap<u32, (u32, u32)>,
    resets: HashMap<u32, u32>,
}

#[derive(Default)]
pub struct SimWorld {
    state: Mutex<WorldState>,
}

impl SimWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Slots `slot_base + n` filled from the inventory, empty drives
    pub fn from_config(config: &RobotConfig) -> Arc<Self> {
        let world = Self::new();
        {
            let mut st = world.state.lock();
            let lib = &config.library;
            for n in 0..lib.storage_count {
                st.elements.insert(lib.slot_base + n, None);
            }
            for item in &config.inventory {
                st.elements
                    .insert(lib.slot_base + item.slot, Some(SimMedium::from_inventory(item)));
            }
            for drive in &lib.drives {
                st.elements.insert(drive.element, None);
                st.drives.insert(drive.element);
            }
        }
        world
    }

    /// Catalog entries matching the inventory of `config`
    pub fn populate_catalog(config: &RobotConfig, catalog: &MemoryCatalog) {
        let eq = config.library.eq;
        for slot in 0..config.library.storage_count {
            let mut entry = CatalogEntry {
                eq,
                slot,
                ..Default::default()
            };
            if let Some(item) = config.inventory.iter().find(|i| i.slot == slot) {
                entry.status = CeStatus::INUSE | CeStatus::OCCUPIED;
                entry.media = item.media;
                entry.capacity = item.capacity;
                entry.space = item.capacity;
                if let Some(barcode) = &item.barcode {
                    entry.barcode = barcode.clone();
                    entry.status |= CeStatus::BAR_CODE;
                }
                if item.cleaning {
                    entry.status |= CeStatus::CLEANING;
                    entry.access = item.uses;
                } else if !item.vsn.is_empty() {
                    entry.vsn = item.vsn.clone();
                    entry.status |= CeStatus::LABELED;
                }
                if item.write_protected {
                    entry.status |= CeStatus::WRITE_PROTECT;
                }
            }
            catalog.insert(entry);
        }
    }

    pub fn set_element(&self, element: u32, medium: Option<SimMedium>) {
        self.state.lock().elements.insert(element, medium);
    }

    pub fn add_drive(&self, element: u32) {
        let mut st = self.state.lock();
        st.drives.insert(element);
        st.elements.entry(element).or_insert(None);
    }

    /// Device handle for the drive at `element`
    pub fn drive(self: &Arc<Self>, element: u32, name: &str) -> SimDrive {
        self.add_drive(element);
        SimDrive::new(self.clone(), element, name)
    }

    pub fn medium_at(&self, element: u32) -> Option<SimMedium> {
        self.state.lock().elements.get(&element).cloned().flatten()
    }

    pub fn is_full(&self, element: u32) -> bool {
        matches!(self.state.lock().elements.get(&element), Some(Some(_)))
    }

    pub fn tape_records(&self, element: u32) -> Vec<Vec<u8>> {
        self.medium_at(element)
            .map(|m| {
                m.records
                    .into_iter()
                    .map(|r| match r {
                        TapeBlock::Data(d) => d,
                        TapeBlock::Filemark => Vec::new(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn faults(&self) -> MappedMutexGuard<'_, Faults> {
        MutexGuard::map(self.state.lock(), |st| &mut st.faults)
    }

    pub fn moves(&self) -> Vec<(u32, u32, bool)> {
        self.state.lock().moves.clone()
    }

    /// (long, short) erase counts for a drive
    pub fn erase_count(&self, element: u32) -> (u32, u32) {
        self.state.lock().erases.get(&element).copied().unwrap_or_default()
    }

    pub fn reset_count(&self, element: u32) -> u32 {
        self.state.lock().resets.get(&element).copied().unwrap_or_default()
    }

    pub(crate) fn do_move(&self, src: u32, dst: u32, invert: bool) -> Result<(), MoveError> {
        let mut st = self.state.lock();
        if st.faults.move_failures > 0 {
            st.faults.move_failures -= 1;
            let err = st
                .faults
                .move_error
                .clone()
                .unwrap_or_else(|| MoveError::Failed("injected move failure".into()));
            return Err(err);
        }
        if st.drives.contains(&src) && st.faults.unload_failures > 0 {
            st.faults.unload_failures -= 1;
            return Err(MoveError::Failed("picker jammed".into()));
        }

        match st.elements.get(&src) {
            None => return Err(MoveError::Failed(format!("no element {}", src))),
            Some(None) => return Err(MoveError::SourceEmpty),
            Some(Some(_)) => {}
        }
        match st.elements.get(&dst) {
            None => return Err(MoveError::Failed(format!("no element {}", dst))),
            Some(Some(_)) if src != dst => return Err(MoveError::DestinationFull),
            _ => {}
        }
        let mut medium = match st.elements.get_mut(&src).and_then(|slot| slot.take()) {
            Some(m) => m,
            None => return Err(MoveError::SourceEmpty),
        };
        if invert {
            medium.flip();
        }
        st.elements.insert(dst, Some(medium));

        if st.drives.contains(&dst) {
            let origin = st.sources.remove(&src).map(|(s, _)| s).unwrap_or(src);
            st.sources.insert(dst, (origin, invert));
            st.positions.insert(dst, 0);
        }
        if st.drives.contains(&src) && src != dst {
            st.sources.remove(&src);
        }
        st.moves.push((src, dst, invert));
        debug!("sim: moved {} -> {} (invert {})", src, dst, invert);
        Ok(())
    }

    pub(crate) fn query(&self, element: u32) -> Result<DriveQuery, MoveError> {
        let st = self.state.lock();
        let medium = st
            .elements
            .get(&element)
            .ok_or_else(|| MoveError::Failed(format!("no element {}", element)))?;
        let source = st.sources.get(&element).copied();
        Ok(DriveQuery {
            element,
            full: medium.is_some(),
            source: source.map(|(s, _)| s),
            barcode: medium.as_ref().and_then(|m| m.barcode.clone()),
            invert: source.map(|(_, i)| i).unwrap_or(false),
        })
    }

    pub(crate) fn drive_elements(&self) -> Vec<u32> {
        let mut elements: Vec<u32> = self.state.lock().drives.iter().copied().collect();
        elements.sort_unstable();
        elements
    }

    /// Run `f` on the medium in `element` and the drive's tape position
    pub(crate) fn with_medium<T>(
        &self,
        element: u32,
        f: impl FnOnce(&mut SimMedium, &mut usize, &mut Faults) -> T,
    ) -> Option<T> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let medium = st.elements.get_mut(&element)?.as_mut()?;
        let pos = st.positions.entry(element).or_insert(0);
        Some(f(medium, pos, &mut st.faults))
    }

    pub(crate) fn count_erase(&self, element: u32, long: bool) {
        let mut st = self.state.lock();
        let counts = st.erases.entry(element).or_default();
        if long {
            counts.0 += 1;
        } else {
            counts.1 += 1;
        }
    }

    pub(crate) fn count_reset(&self, element: u32) {
        *self.state.lock().resets.entry(element).or_default() += 1;
    }
}
