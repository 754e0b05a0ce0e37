//! Getting media into and out of a drive

use chrono::Utc;
use std::thread;
use tracing::{debug, error, info, warn};

use super::{down_drive, release_unit, scan, volume_info, Drive, DriveStatus};
use crate::catalog::{CatalogEntry, CatalogField, CeStatus, UpdateReason};
use crate::device::{DeviceState, UnitStatus};
use crate::error::{Errno, Result, RobotError};
use crate::event::Event;
use crate::library::{Library, SIDE_B};
use crate::scsi::{wait_for_device_ready, SenseClass};
use crate::transport::MoveError;

/// Why `get_media` could not deliver the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMediaError {
    /// The drive was downed
    DownDrive,
    /// The medium was quarantined
    BadMedia,
    /// Transient robot failure, the request may be retried
    RetError,
    /// The request cannot be served, dispose it
    Dispose,
    /// The volume is busy elsewhere, send the request back
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinError {
    DownEquipment,
    BadMedia,
    NoMedia,
}

fn is_side_b(lib: &Library, partition: u8) -> bool {
    lib.two_sided && partition == SIDE_B
}

/// Clear `OCCUPIED` on the slot about to be emptied. The entry is re-read
/// so a stale caller copy cannot hide an empty slot.
fn check_and_set_occupy(
    lib: &Library,
    drive: &Drive,
    ce: &CatalogEntry,
) -> std::result::Result<(), GetMediaError> {
    let current = lib.ctx.catalog.get_by_loc(lib.eq, ce.slot, ce.partition);
    match current {
        Some(cur) if cur.has(CeStatus::OCCUPIED) => {
            lib.set_occupied(ce.slot, false);
            Ok(())
        }
        _ => {
            let elsewhere = lib
                .drives
                .iter()
                .filter(|d| d.unit.eq != drive.unit.eq)
                .any(|d| d.lock().media_element == Some(lib.slot_element(ce.slot)));
            if elsewhere {
                debug!("eq {}: slot {} is in another drive", drive.unit.eq, ce.slot);
                Err(GetMediaError::Requeued)
            } else {
                warn!("eq {}: slot {} is not occupied", drive.unit.eq, ce.slot);
                Err(GetMediaError::Dispose)
            }
        }
    }
}

/// Move `src` into the drive. API transports retry with backoff.
fn move_to_drive(
    lib: &Library,
    drive: &Drive,
    ce: &CatalogEntry,
    src: u32,
    invert: bool,
) -> std::result::Result<(), GetMediaError> {
    let eq = drive.unit.eq;
    let kind = lib.transport.kind();
    let timing = lib.ctx.timing();
    let attempts = if kind.is_api() { timing.load_retries.max(1) } else { 1 };

    let mut last = None;
    for attempt in 1..=attempts {
        match lib
            .transport
            .move_media(lib.transport_element, src, drive.element, invert)
        {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    "eq {}: load of slot {} failed (attempt {}/{}): {}",
                    eq, ce.slot, attempt, attempts, e
                );
                if e.restores_occupied() || e == MoveError::SourceEmpty {
                    last = Some(e);
                    break;
                }
                last = Some(e);
                if attempt < attempts {
                    thread::sleep(timing.load_backoff());
                }
            }
        }
    }

    let catalog = &lib.ctx.catalog;
    match last {
        Some(MoveError::Recovered) => {
            lib.set_occupied(ce.slot, true);
            Err(GetMediaError::RetError)
        }
        Some(MoveError::Incompatible) => {
            lib.set_occupied(ce.slot, true);
            if let Err(e) =
                catalog.set_status(lib.eq, ce.slot, ce.partition, CeStatus::BAD_MEDIA, true)
            {
                warn!("eq {}: cannot flag slot {} bad: {}", eq, ce.slot, e);
            }
            drive
                .unit
                .set_message(format!("incompatible media in slot {}", ce.slot));
            Err(GetMediaError::BadMedia)
        }
        Some(MoveError::SourceEmpty) => {
            if let Err(e) =
                catalog.set_status(lib.eq, ce.slot, ce.partition, CeStatus::NEEDS_AUDIT, true)
            {
                warn!("eq {}: cannot flag slot {} for audit: {}", eq, ce.slot, e);
            }
            Err(GetMediaError::Dispose)
        }
        other => {
            lib.set_occupied(ce.slot, true);
            let reason = match other {
                Some(e) => format!("load of slot {} failed: {}", ce.slot, e),
                None => format!("load of slot {} failed", ce.slot),
            };
            down_drive(drive, &reason);
            Err(GetMediaError::DownDrive)
        }
    }
}

fn open_unit(drive: &Drive) -> std::result::Result<(), GetMediaError> {
    let needs_open = drive.unit.lock().open_count == 0;
    if needs_open {
        if let Err(e) = drive.io.open() {
            error!("eq {}: open {} failed: {}", drive.unit.eq, drive.unit.name, e);
            down_drive(drive, "unable to open device");
            return Err(GetMediaError::DownDrive);
        }
    }
    drive.unit.lock().inc_open();
    Ok(())
}

/// Make `ce` the loaded volume and open the unit.
///
/// Takes an active reference on the unit whether it succeeds or not; the
/// caller drops it. The drive lock is held by the caller, the unit lock is
/// only taken for short updates.
pub fn get_media(
    lib: &Library,
    drive: &Drive,
    d: &mut DriveStatus,
    ce: &CatalogEntry,
) -> std::result::Result<(), GetMediaError> {
    let eq = drive.unit.eq;
    drive.unit.lock().inc_active();
    let element = lib.slot_element(ce.slot);

    if d.full && d.media_element == Some(element) {
        if lib.two_sided && d.partition != ce.partition {
            flip_and_scan(lib, drive, d, ce.partition)?;
        }
        return open_unit(drive);
    }

    if d.full {
        debug!("eq {}: exchanging slot {:?} for slot {}", eq, d.slot, ce.slot);
        if let Err(e) = clear_drive_locked(lib, drive, d) {
            error!("eq {}: exchange failed: {}", eq, e);
            return Err(GetMediaError::DownDrive);
        }
    }

    check_and_set_occupy(lib, drive, ce)?;
    let invert = is_side_b(lib, ce.partition);
    drive.unit.set_message(format!("loading slot {}", ce.slot));
    move_to_drive(lib, drive, ce, element, invert)?;

    *d = DriveStatus {
        full: true,
        valid: true,
        invert,
        media_element: Some(element),
        slot: Some(ce.slot),
        partition: ce.partition,
        bar_code: ce.has_barcode().then(|| ce.barcode.clone()),
    };
    {
        let mut st = drive.unit.lock();
        st.clear_fields();
        st.vsn = ce.vsn.clone();
        st.media = Some(ce.media);
        st.slot = Some(ce.slot);
        st.partition = ce.partition;
        st.flip_partition = lib.two_sided.then_some(if invert { 0 } else { SIDE_B });
        st.space = ce.space;
        st.capacity = ce.capacity;
        st.status |= UnitStatus::PRESENT;
        if ce.has(CeStatus::READ_ONLY) {
            st.status |= UnitStatus::READ_ONLY;
        }
        if ce.has(CeStatus::BAD_MEDIA) {
            st.status |= UnitStatus::BAD_MEDIA;
        }
        st.set_message(format!("loaded slot {}", ce.slot));
    }
    if let Err(e) = lib.ctx.catalog.set_field(
        lib.eq,
        ce.slot,
        ce.partition,
        CatalogField::MountTime(Utc::now().timestamp()),
    ) {
        warn!("eq {}: mount time not recorded: {}", eq, e);
    }
    info!("eq {}: loaded slot {} ({:?})", eq, ce.slot, ce.vsn);
    open_unit(drive)
}

/// Return the loaded medium to its slot
pub fn clear_drive(lib: &Library, drive: &Drive) -> Result<()> {
    let mut d = drive.lock();
    clear_drive_locked(lib, drive, &mut d)
}

/// `clear_drive` for a caller already holding the drive lock
pub fn clear_drive_locked(lib: &Library, drive: &Drive, d: &mut DriveStatus) -> Result<()> {
    if !d.full {
        return Ok(());
    }
    let eq = drive.unit.eq;
    if let Err(e) = drive.io.start_stop(false, true) {
        debug!("eq {}: unload spin down: {}", eq, e);
    }
    drive.io.close();

    let Some(src) = d.media_element else {
        down_drive(drive, "medium source unknown");
        return Err(RobotError::invalid_state(format!(
            "eq {}: loaded medium has no source element",
            eq
        )));
    };
    let info = volume_info(lib, &drive.unit.lock());

    drive.unit.set_message("unloading");
    if let Err(e) = lib
        .transport
        .move_media(lib.transport_element, drive.element, src, d.invert)
    {
        error!("eq {}: unload to element {} failed: {}", eq, src, e);
        down_drive(drive, &format!("unload failed: {}", e));
        return Err(RobotError::transport(format!(
            "eq {}: unload to element {} failed: {}",
            eq, src, e
        )));
    }

    if let Some(slot) = lib.element_slot(src) {
        lib.set_occupied(slot, true);
    }
    if let Some(info) = info {
        if let Err(e) = lib.ctx.catalog.update(&info, UpdateReason::VolumeUnloaded) {
            warn!("eq {}: unload of slot {} not recorded: {}", eq, info.slot, e);
        }
    }

    *d = DriveStatus::default();
    let mut st = drive.unit.lock();
    let keep = st.status & (UnitStatus::CLEANING | UnitStatus::REQUESTED | UnitStatus::AUDIT);
    st.clear_fields();
    st.status = UnitStatus::PRESENT | keep;
    st.open_count = 0;
    st.slot = None;
    st.partition = 0;
    st.flip_partition = None;
    st.set_message("empty");
    debug!("eq {}: unloaded to element {}", eq, src);
    Ok(())
}

/// Spin the medium up (or down) and classify what the drive says
pub fn spin_drive(lib: &Library, drive: &Drive, up: bool) -> std::result::Result<(), SpinError> {
    let eq = drive.unit.eq;
    if !up {
        if let Err(e) = drive.io.start_stop(false, false) {
            debug!("eq {}: spin down: {}", eq, e);
        }
        return Ok(());
    }
    if let Err(e) = drive.io.start_stop(true, false) {
        debug!("eq {}: spin up: {}", eq, e);
    }

    let timing = lib.ctx.timing();
    match wait_for_device_ready(drive.io.as_ref(), timing.tur_retries, timing.tur_interval()) {
        Ok(SenseClass::CleaningRequested) => {
            let mut st = drive.unit.lock();
            st.status |= UnitStatus::CLEANING;
            st.set_message("drive needs cleaning");
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e) => match e.class() {
            SenseClass::NoMedia => Err(SpinError::NoMedia),
            SenseClass::MediumError => {
                let (slot, part) = {
                    let mut st = drive.unit.lock();
                    st.status |= UnitStatus::BAD_MEDIA;
                    st.set_message("media error on spin up");
                    (st.slot, st.partition)
                };
                if let Some(slot) = slot {
                    error!("eq {}: medium in slot {} is bad: {}", eq, slot, e);
                    if let Err(ce) = lib.ctx.catalog.set_status(
                        lib.eq,
                        slot,
                        part,
                        CeStatus::BAD_MEDIA,
                        true,
                    ) {
                        warn!("eq {}: cannot flag slot {} bad: {}", eq, slot, ce);
                    }
                }
                Err(SpinError::BadMedia)
            }
            _ => {
                down_drive(drive, &format!("spin up failed: {}", e));
                Err(SpinError::DownEquipment)
            }
        },
    }
}

/// Turn a two-sided medium over: drive to slot, then back inverted
pub fn flip(lib: &Library, drive: &Drive, d: &mut DriveStatus) -> std::result::Result<(), MoveError> {
    let src = d
        .media_element
        .ok_or_else(|| MoveError::Failed("nothing loaded".into()))?;
    if let Err(e) = drive.io.start_stop(false, true) {
        debug!("eq {}: flip spin down: {}", drive.unit.eq, e);
    }
    drive.io.close();

    lib.transport
        .move_media(lib.transport_element, drive.element, src, d.invert)?;
    let invert = !d.invert;
    lib.transport
        .move_media(lib.transport_element, src, drive.element, invert)?;
    d.invert = invert;
    d.partition = if invert { SIDE_B } else { 0 };
    Ok(())
}

/// Bring side `partition` up and refresh unit and catalog from it
pub fn flip_and_scan(
    lib: &Library,
    drive: &Drive,
    d: &mut DriveStatus,
    partition: u8,
) -> std::result::Result<(), GetMediaError> {
    let eq = drive.unit.eq;
    if d.partition == partition {
        return Ok(());
    }
    info!("eq {}: flipping slot {:?} to side {}", eq, d.slot, partition);
    if let Err(e) = flip(lib, drive, d) {
        error!("eq {}: flip failed: {}", eq, e);
        down_drive(drive, &format!("flip failed: {}", e));
        return Err(GetMediaError::DownDrive);
    }

    let ce = d
        .slot
        .and_then(|slot| lib.ctx.catalog.get_by_loc(lib.eq, slot, partition));
    let reopened = {
        let mut st = drive.unit.lock();
        st.clear_fields();
        st.partition = partition;
        st.flip_partition = Some(if partition == SIDE_B { 0 } else { SIDE_B });
        if let Some(ce) = &ce {
            st.vsn = ce.vsn.clone();
            st.media = Some(ce.media);
        }
        st.status |= UnitStatus::PRESENT;
        st.open_count > 0
    };
    if reopened {
        if let Err(e) = drive.io.open() {
            warn!("eq {}: reopen after flip failed: {}", eq, e);
        }
    }

    match spin_drive(lib, drive, true) {
        Ok(()) => {}
        Err(SpinError::BadMedia) => return Err(GetMediaError::BadMedia),
        Err(SpinError::NoMedia) => return Err(GetMediaError::RetError),
        Err(SpinError::DownEquipment) => return Err(GetMediaError::DownDrive),
    }
    let opened = drive.unit.lock().open_count > 0;
    if !opened {
        if let Err(e) = drive.io.open() {
            warn!("eq {}: open for side {} scan failed: {}", eq, partition, e);
            drive.unit.set_message("cannot open device to scan flipped side");
            return Err(GetMediaError::RetError);
        }
    }
    scan::scan_a_device(&drive.unit, drive.io.as_ref());
    if !opened {
        drive.io.close();
    }
    if let Some(info) = volume_info(lib, &drive.unit.lock()) {
        if let Err(e) = lib.ctx.catalog.update(&info, UpdateReason::VolumeLoaded) {
            warn!("eq {}: side {} not recorded: {}", eq, partition, e);
        }
    }
    Ok(())
}

/// Learn what the drive holds at startup
pub(crate) fn init_drive(lib: &Library, drive: &Drive) {
    let eq = drive.unit.eq;
    match drive.io.inquiry() {
        Ok(ident) => {
            debug!("eq {}: {} {} {}", eq, ident.vendor, ident.product, ident.revision);
            drive.unit.lock().ident = Some(ident);
        }
        Err(e) => warn!("eq {}: inquiry failed: {}", eq, e),
    }

    let q = match lib.transport.query_drive(drive.element) {
        Ok(q) => q,
        Err(e) => {
            error!("eq {}: cannot query drive element {}: {}", eq, drive.element, e);
            down_drive(drive, "drive query failed");
            return;
        }
    };
    let source_slot = q.source.and_then(|src| lib.element_slot(src));
    let (Some(src), Some(slot), true) = (q.source, source_slot, q.full) else {
        if q.full {
            warn!("eq {}: loaded medium has no known source slot", eq);
            drive.unit.set_message("medium of unknown origin in drive");
        } else {
            drive.unit.set_message("empty");
        }
        return;
    };

    let partition = if lib.two_sided && q.invert { SIDE_B } else { 0 };
    let ce = lib.ctx.catalog.get_by_loc(lib.eq, slot, partition);
    {
        let mut d = drive.lock();
        *d = DriveStatus {
            full: true,
            valid: true,
            invert: q.invert,
            media_element: Some(src),
            slot: Some(slot),
            partition,
            bar_code: q.barcode.clone(),
        };
    }
    {
        let mut st = drive.unit.lock();
        st.inc_active();
        st.slot = Some(slot);
        st.partition = partition;
        st.status |= UnitStatus::PRESENT;
        if let Some(ce) = &ce {
            st.vsn = ce.vsn.clone();
            st.media = Some(ce.media);
        }
    }
    info!("eq {}: found slot {} loaded at startup", eq, slot);

    if drive.unit.state() < DeviceState::Off && open_unit(drive).is_ok() {
        if spin_drive(lib, drive, true).is_ok() {
            scan::scan_a_device(&drive.unit, drive.io.as_ref());
            if let Some(info) = volume_info(lib, &drive.unit.lock()) {
                if let Err(e) = lib.ctx.catalog.update(&info, UpdateReason::VolumeLoaded) {
                    warn!("eq {}: startup volume not recorded: {}", eq, e);
                }
            }
            let vsn = drive.unit.lock().vsn.clone();
            lib.ctx.previews.check_preview(&vsn);
        }
    }
    release_unit(drive);
}

/// Re-read the drive element and drop state the robot contradicts
pub(crate) fn query(lib: &Library, drive: &Drive) {
    let eq = drive.unit.eq;
    match lib.transport.query_drive(drive.element) {
        Ok(q) => {
            let mut d = drive.lock();
            if d.full && !q.full {
                warn!("eq {}: robot reports drive empty, forgetting slot {:?}", eq, d.slot);
                *d = DriveStatus::default();
                let mut st = drive.unit.lock();
                st.clear_fields();
                st.slot = None;
                st.set_message("empty");
            } else if d.full {
                d.bar_code = q.barcode.or(d.bar_code.take());
                d.valid = true;
            }
        }
        Err(e) => warn!("eq {}: drive query failed: {}", eq, e),
    }
}

/// Operator unload
pub(crate) fn unload(lib: &Library, drive: &Drive, event: Event) {
    let eq = drive.unit.eq;
    {
        let mut st = drive.unit.lock();
        if st.active > 0 || st.open_count > 0 {
            st.status |= UnitStatus::UNLOAD;
            st.set_message("unload pending: drive busy");
            drop(st);
            info!("eq {}: unload refused, drive busy", eq);
            event.dispose(Errno::EAGAIN);
            return;
        }
        st.inc_active();
    }
    let result = clear_drive(lib, drive);
    {
        let mut st = drive.unit.lock();
        st.status.remove(UnitStatus::UNLOAD | UnitStatus::REQUESTED);
        drive.unit.release(&mut st);
    }
    match result {
        Ok(()) => {
            lib.request_check();
            event.dispose(Errno::Ok);
        }
        Err(e) => {
            error!("eq {}: unload failed: {}", eq, e);
            event.dispose(Errno::EIO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RobotConfig, Timing};
    use crate::sim::{SimMedium, SimWorld};
    use std::sync::Arc;

    fn setup(config: RobotConfig) -> (Arc<Library>, Arc<SimWorld>) {
        let world = SimWorld::from_config(&config);
        let (lib, _) = Library::with_world(config, &world).unwrap();
        (lib, world)
    }

    fn fast() -> RobotConfig {
        RobotConfig {
            timing: Timing::fast(),
            ..Default::default()
        }
    }

    #[test]
    fn test_get_media_and_clear_drive() {
        let (lib, world) = setup(fast());
        let drive = lib.drives[0].clone();
        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 1, 0).unwrap();

        get_media(&lib, &drive, &mut drive.lock(), &ce).unwrap();
        assert!(world.is_full(drive.element));
        assert!(!lib.ctx.catalog.get_by_loc(lib.eq, 1, 0).unwrap().has(CeStatus::OCCUPIED));
        {
            let st = drive.unit.lock();
            assert_eq!(st.active, 1);
            assert_eq!(st.open_count, 1);
            assert_eq!(st.slot, Some(1));
        }

        clear_drive(&lib, &drive).unwrap();
        assert!(world.is_full(lib.slot_element(1)));
        assert!(lib.ctx.catalog.get_by_loc(lib.eq, 1, 0).unwrap().has(CeStatus::OCCUPIED));
        let st = drive.unit.lock();
        assert_eq!(st.status, UnitStatus::PRESENT);
        assert_eq!(st.open_count, 0);
        assert!(!drive.lock().full);
    }

    #[test]
    fn test_exchange_returns_old_medium() {
        let (lib, world) = setup(fast());
        let drive = lib.drives[0].clone();
        let first = lib.ctx.catalog.get_by_loc(lib.eq, 0, 0).unwrap();
        let second = lib.ctx.catalog.get_by_loc(lib.eq, 3, 0).unwrap();

        get_media(&lib, &drive, &mut drive.lock(), &first).unwrap();
        release_unit(&drive);
        get_media(&lib, &drive, &mut drive.lock(), &second).unwrap();
        release_unit(&drive);

        assert!(world.is_full(lib.slot_element(0)));
        assert!(!world.is_full(lib.slot_element(3)));
        assert_eq!(drive.lock().slot, Some(3));
    }

    #[test]
    fn test_empty_slot_is_disposed() {
        let (lib, world) = setup(fast());
        let drive = lib.drives[0].clone();
        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 2, 0).unwrap();
        world.set_element(lib.slot_element(2), None);

        let err = get_media(&lib, &drive, &mut drive.lock(), &ce).unwrap_err();
        assert_eq!(err, GetMediaError::Dispose);
        assert!(lib
            .ctx
            .catalog
            .get_by_loc(lib.eq, 2, 0)
            .unwrap()
            .has(CeStatus::NEEDS_AUDIT));
        assert_eq!(drive.unit.state(), DeviceState::On);
    }

    #[test]
    fn test_incompatible_media_flags_bad() {
        let (lib, world) = setup(fast());
        let drive = lib.drives[0].clone();
        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 2, 0).unwrap();
        {
            let mut f = world.faults();
            f.move_failures = 1;
            f.move_error = Some(MoveError::Incompatible);
        }
        let err = get_media(&lib, &drive, &mut drive.lock(), &ce).unwrap_err();
        assert_eq!(err, GetMediaError::BadMedia);
        let now = lib.ctx.catalog.get_by_loc(lib.eq, 2, 0).unwrap();
        assert!(now.has(CeStatus::OCCUPIED));
        assert!(now.has(CeStatus::BAD_MEDIA));
    }

    #[test]
    fn test_move_failure_downs_drive() {
        let (lib, world) = setup(fast());
        let drive = lib.drives[0].clone();
        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 2, 0).unwrap();
        world.faults().move_failures = 5;
        let err = get_media(&lib, &drive, &mut drive.lock(), &ce).unwrap_err();
        assert_eq!(err, GetMediaError::DownDrive);
        assert_eq!(drive.unit.state(), DeviceState::Down);
        assert!(lib.ctx.catalog.get_by_loc(lib.eq, 2, 0).unwrap().has(CeStatus::OCCUPIED));
    }

    #[test]
    fn test_spin_up_bad_media() {
        let (lib, world) = setup(fast());
        let drive = lib.drives[0].clone();
        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 1, 0).unwrap();
        let mut bad = SimMedium::tape("VSN001", ce.media, 1000);
        bad.bad = true;
        world.set_element(lib.slot_element(1), Some(bad));

        get_media(&lib, &drive, &mut drive.lock(), &ce).unwrap();
        assert_eq!(spin_drive(&lib, &drive, true), Err(SpinError::BadMedia));
        assert!(drive.unit.status().contains(UnitStatus::BAD_MEDIA));
        assert!(lib.ctx.catalog.get_by_loc(lib.eq, 1, 0).unwrap().has(CeStatus::BAD_MEDIA));
        assert_eq!(drive.unit.state(), DeviceState::On);
    }

    #[test]
    fn test_cleaning_request_sets_unit_bit() {
        let (lib, world) = setup(fast());
        let drive = lib.drives[0].clone();
        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 1, 0).unwrap();
        get_media(&lib, &drive, &mut drive.lock(), &ce).unwrap();
        world.faults().request_cleaning.insert(drive.element);
        spin_drive(&lib, &drive, true).unwrap();
        assert!(drive.unit.status().contains(UnitStatus::CLEANING));
    }

    #[test]
    fn test_flip_two_sided() {
        let mut config = fast();
        config.library.two_sided = true;
        let (lib, world) = setup(config);
        let drive = lib.drives[0].clone();
        let side_a = SimMedium::optical("SIDEA", crate::catalog::MediaType::MagnetoOptical, 4096);
        let side_b = SimMedium::optical("SIDEB", crate::catalog::MediaType::MagnetoOptical, 4096);
        world.set_element(lib.slot_element(0), Some(side_a.with_other_side(side_b)));

        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 0, 0).unwrap();
        let mut d = drive.lock();
        get_media(&lib, &drive, &mut d, &ce).unwrap();
        flip(&lib, &drive, &mut d).unwrap();
        assert!(d.invert);
        assert_eq!(d.partition, SIDE_B);
        let moves = world.moves();
        assert_eq!(moves.len(), 3);
        assert_eq!(moves[2], (lib.slot_element(0), drive.element, true));
    }

    #[test]
    fn test_flip_scan_skipped_when_open_fails() {
        let mut config = fast();
        config.library.two_sided = true;
        let (lib, world) = setup(config);
        let drive = lib.drives[0].clone();
        let side_a = SimMedium::optical("SIDEA", crate::catalog::MediaType::MagnetoOptical, 4096);
        let side_b = SimMedium::optical("SIDEB", crate::catalog::MediaType::MagnetoOptical, 4096);
        world.set_element(lib.slot_element(0), Some(side_a.with_other_side(side_b)));

        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 0, 0).unwrap();
        let mut d = drive.lock();
        get_media(&lib, &drive, &mut d, &ce).unwrap();
        release_unit(&drive);
        assert_eq!(drive.unit.lock().open_count, 0);

        world.faults().open_failures = 1;
        let res = flip_and_scan(&lib, &drive, &mut d, SIDE_B);
        assert!(matches!(res, Err(GetMediaError::RetError)));
        let st = drive.unit.snapshot();
        assert!(!st.status.intersects(UnitStatus::READY | UnitStatus::LABELED));
        assert_eq!(st.dis_mes, "cannot open device to scan flipped side");
    }
}
