//! Inventory audit
//!
//! A library-wide audit runs on every usable drive at once: each drive
//! checks in, then keeps claiming the next slot index until none are left.
//! Two-sided media are audited on both sides by the drive that claimed the
//! slot.

use tracing::{debug, info, warn};

use super::{clear_requested, close_unit, media, release_unit, scan, volume_info, Drive};
use crate::catalog::{CatalogEntry, CeStatus, UpdateReason};
use crate::device::{DeviceState, UnitStatus};
use crate::error::Errno;
use crate::event::Event;
use crate::labels::{vsn_from_barcode, LEN_OPTIC_VSN, LEN_TAPE_VSN};
use crate::library::{Library, SIDE_B};

/// Tape space left after the recorded data
fn space_from_eod(drive: &Drive) {
    let block_size = {
        let st = drive.unit.lock();
        if st.block_size > 0 {
            st.block_size
        } else {
            st.tape.default_blocksize
        }
    };
    let reached = {
        let _io = drive.unit.io_mutex.lock();
        let reached = drive.io.space_to_eod();
        if let Err(e) = drive.io.rewind() {
            debug!("eq {}: rewind after EOD: {}", drive.unit.eq, e);
        }
        reached
    };
    match reached {
        Ok(blocks) => {
            let used = blocks.saturating_mul(u64::from(block_size)) / 1024;
            let mut st = drive.unit.lock();
            st.space = st.capacity.saturating_sub(used);
            let full = st.space == 0;
            st.status.set(UnitStatus::STOR_FULL, full);
            debug!("eq {}: EOD at block {}, {} KiB left", drive.unit.eq, blocks, st.space);
        }
        Err(e) => warn!("eq {}: space to EOD failed: {}", drive.unit.eq, e),
    }
}

/// Scan the side that is up and record it
fn audit_side(lib: &Library, drive: &Drive, ce: &CatalogEntry, eod: bool) {
    let eq = drive.unit.eq;
    scan::scan_a_device(&drive.unit, drive.io.as_ref());

    let (labeled, strange) = {
        let st = drive.unit.lock();
        (
            st.status.contains(UnitStatus::LABELED),
            st.status.contains(UnitStatus::STRANGE),
        )
    };
    let defaults = lib.ctx.defaults();
    if !labeled && !strange && defaults.label_barcode && ce.has_barcode() {
        // 目录中以条码为 VSN，介质上并没有写标签
        let max = if drive.unit.is_tape() { LEN_TAPE_VSN } else { LEN_OPTIC_VSN };
        let vsn = vsn_from_barcode(&ce.barcode, defaults.barcode_truncation, max);
        let mut st = drive.unit.lock();
        st.vsn = vsn;
        st.status |= UnitStatus::LABELED;
        st.space = st.capacity;
    } else if labeled && eod && drive.unit.is_tape() {
        space_from_eod(drive);
    }

    let info = {
        let mut st = drive.unit.lock();
        st.slot = Some(ce.slot);
        st.partition = ce.partition;
        volume_info(lib, &st)
    };
    if let Some(info) = info {
        info!(
            "eq {}: audit slot {}:{} {}",
            eq,
            ce.slot,
            ce.partition,
            if info.labeled { info.vsn.as_str() } else { "(unlabeled)" }
        );
        if let Err(e) = lib.ctx.catalog.update(&info, UpdateReason::Audit) {
            warn!("eq {}: audit of slot {} not recorded: {}", eq, ce.slot, e);
        }
    }
}

/// Audit one slot with this drive. The medium is left in the drive.
pub(crate) fn audit_slot(lib: &Library, drive: &Drive, slot: u32, eod: bool) -> Errno {
    let eq = drive.unit.eq;
    let Some(ce) = lib.ctx.catalog.get_by_loc(lib.eq, slot, 0) else {
        debug!("eq {}: audit: no catalog entry for slot {}", eq, slot);
        return Errno::ENOENT;
    };
    let here = drive.lock().media_element == Some(lib.slot_element(slot));
    if !ce.has(CeStatus::OCCUPIED) && !here {
        debug!("eq {}: audit: slot {} is empty", eq, slot);
        return Errno::ENOENT;
    }
    if ce.has(CeStatus::CLEANING | CeStatus::NON_SAM) {
        debug!("eq {}: audit: slot {} skipped", eq, slot);
        return Errno::ENOENT;
    }

    drive.unit.set_message(format!("auditing slot {}", slot));
    let loaded = {
        let mut d = drive.lock();
        media::get_media(lib, drive, &mut d, &ce)
    };
    if let Err(err) = loaded {
        warn!("eq {}: audit: load of slot {} failed: {:?}", eq, slot, err);
        release_unit(drive);
        return Errno::EIO;
    }
    if let Err(err) = media::spin_drive(lib, drive, true) {
        warn!("eq {}: audit: spin up of slot {} failed: {:?}", eq, slot, err);
        close_unit(drive);
        if err != media::SpinError::DownEquipment {
            if let Err(e) = media::clear_drive(lib, drive) {
                warn!("eq {}: unload after failed spin up: {}", eq, e);
            }
        }
        release_unit(drive);
        return Errno::EIO;
    }

    audit_side(lib, drive, &ce, eod);

    if lib.two_sided {
        let flipped = {
            let mut d = drive.lock();
            media::flip_and_scan(lib, drive, &mut d, SIDE_B)
        };
        match flipped {
            Ok(()) => match lib.ctx.catalog.get_by_loc(lib.eq, slot, SIDE_B) {
                Some(side_b) => audit_side(lib, drive, &side_b, eod),
                None => debug!("eq {}: audit: slot {} has no side B entry", eq, slot),
            },
            Err(err) => warn!("eq {}: audit: flip of slot {} failed: {:?}", eq, slot, err),
        }
    }

    release_unit(drive);
    Errno::Ok
}

/// Audit a single slot on request
pub fn audit_request(lib: &Library, drive: &Drive, event: Event, slot: u32, eod: bool) {
    drive.unit.lock().status |= UnitStatus::AUDIT;
    let errno = audit_slot(lib, drive, slot, eod);
    {
        let mut st = drive.unit.lock();
        if !lib.flags().audit {
            st.status.remove(UnitStatus::AUDIT);
        }
    }
    clear_requested(drive);
    event.dispose(errno);
    lib.request_check();
}

/// This drive's share of a library-wide audit
pub fn start_audit(lib: &Library, drive: &Drive, event: Event, eod: bool) {
    let eq = drive.unit.eq;
    lib.join_audit();
    let mut audited = 0usize;
    while drive.unit.state() < DeviceState::Off && !lib.is_shutting_down() {
        let Some(slot) = lib.claim_audit_slot() else {
            break;
        };
        if audit_slot(lib, drive, slot, eod).is_ok() {
            audited += 1;
        }
    }
    info!("eq {}: audited {} slots", eq, audited);
    drive.unit.lock().status.remove(UnitStatus::AUDIT | UnitStatus::REQUESTED);
    lib.leave_audit();
    event.dispose(Errno::Ok);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, MediaType, MemoryCatalog};
    use crate::config::{RobotConfig, Timing};
    use crate::sim::{SimMedium, SimWorld, TapeBlock};
    use std::sync::Arc;

    fn setup(config: RobotConfig) -> (Arc<Library>, Arc<MemoryCatalog>, Arc<SimWorld>) {
        let world = SimWorld::from_config(&config);
        let (lib, catalog) = Library::with_world(config, &world).unwrap();
        (lib, catalog, world)
    }

    fn fast() -> RobotConfig {
        RobotConfig {
            timing: Timing::fast(),
            ..Default::default()
        }
    }

    #[test]
    fn test_audit_slot_records_label() {
        let (lib, catalog, _) = setup(fast());
        let drive = lib.drives[0].clone();
        catalog.set_status(lib.eq, 3, 0, CeStatus::NEEDS_AUDIT, true).unwrap();
        assert_eq!(audit_slot(&lib, &drive, 3, false), Errno::Ok);

        let ce = catalog.get_by_loc(lib.eq, 3, 0).unwrap();
        assert_eq!(ce.vsn, "VSN003");
        assert!(!ce.has(CeStatus::NEEDS_AUDIT));
        assert_eq!(drive.unit.lock().active, 0);
        let last = catalog.history().pop().unwrap();
        assert_eq!(last.reason, UpdateReason::Audit);
    }

    #[test]
    fn test_audit_skips_cleaning_and_empty() {
        let (lib, _, world) = setup(fast());
        let drive = lib.drives[0].clone();
        assert_eq!(audit_slot(&lib, &drive, 9, false), Errno::ENOENT);
        assert_eq!(audit_slot(&lib, &drive, 7, false), Errno::ENOENT);
        assert!(world.moves().is_empty());
    }

    #[test]
    fn test_barcode_label_lie() {
        let mut config = fast();
        config.defaults.label_barcode = true;
        let (lib, catalog, _) = setup(config);
        let drive = lib.drives[0].clone();
        assert_eq!(audit_slot(&lib, &drive, 4, false), Errno::Ok);
        let ce = catalog.get_by_loc(lib.eq, 4, 0).unwrap();
        assert_eq!(ce.vsn, "VSN004");
        assert!(ce.has(CeStatus::LABELED));
        assert_eq!(ce.space, ce.capacity);
    }

    #[test]
    fn test_eod_sets_space() {
        let (lib, catalog, world) = setup(fast());
        let drive = lib.drives[0].clone();
        let element = lib.slot_element(2);
        let mut medium = world.medium_at(element).unwrap();
        for _ in 0..10 {
            medium.records.push(TapeBlock::Data(vec![0; 16]));
        }
        let blocks = medium.records.len() as u64;
        world.set_element(element, Some(medium));

        assert_eq!(audit_slot(&lib, &drive, 2, true), Errno::Ok);
        let ce = catalog.get_by_loc(lib.eq, 2, 0).unwrap();
        let block_size = drive.unit.lock().block_size as u64;
        assert_eq!(ce.space, ce.capacity - blocks * block_size / 1024);
    }

    #[test]
    fn test_two_sided_audits_both_sides() {
        let mut config = fast();
        config.library.two_sided = true;
        for drive in &mut config.library.drives {
            drive.class = crate::device::DeviceClass::Optical;
        }
        config.inventory.clear();
        let (lib, catalog, world) = setup(config);
        let drive = lib.drives[0].clone();

        let platter = SimMedium::optical("SIDEA", MediaType::MagnetoOptical, 4096)
            .with_other_side(SimMedium::optical("SIDEB", MediaType::MagnetoOptical, 4096));
        world.set_element(lib.slot_element(0), Some(platter));
        for part in [0, SIDE_B] {
            catalog.insert(CatalogEntry {
                eq: lib.eq,
                slot: 0,
                partition: part,
                media: MediaType::MagnetoOptical,
                status: CeStatus::INUSE | CeStatus::OCCUPIED,
                ..Default::default()
            });
        }

        assert_eq!(audit_slot(&lib, &drive, 0, false), Errno::Ok);
        assert_eq!(catalog.get_by_loc(lib.eq, 0, 0).unwrap().vsn, "SIDEA");
        assert_eq!(catalog.get_by_loc(lib.eq, 0, SIDE_B).unwrap().vsn, "SIDEB");
    }
}
