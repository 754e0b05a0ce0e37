//! Labeling media
//!
//! A label request names a slot; the medium is loaded, checked against
//! the label rules and written. `write_and_record` is shared with the
//! barcode auto-label done during mounts.

use tracing::{error, info, warn};

use super::{
    clear_requested, close_unit, media, release_unit, scan, volume_info, Drive, GetMediaError,
};
use crate::catalog::{CatalogEntry, CeStatus, UpdateReason};
use crate::device::{DeviceClass, UnitStatus};
use crate::error::Errno;
use crate::event::{Event, LabelRequest};
use crate::labels::{
    self, vsn_from_barcode, LabelError, LabelFlags, LabelParams, LEN_OPTIC_VSN, LEN_TAPE_VSN,
};
use crate::library::Library;

fn max_vsn_len(drive: &Drive) -> usize {
    if drive.unit.is_tape() {
        LEN_TAPE_VSN
    } else {
        LEN_OPTIC_VSN
    }
}

/// Catalog flags that rule a slot out as a label target
fn refuse_entry(ce: &CatalogEntry) -> Option<&'static str> {
    if ce.has(CeStatus::CLEANING) {
        Some("cannot label cleaning cartridge")
    } else if ce.has(CeStatus::UNAVAIL) {
        Some("volume is unavailable")
    } else if ce.has(CeStatus::WRITE_PROTECT) {
        Some("volume is write protected")
    } else if ce.has(CeStatus::READ_ONLY) {
        Some("volume is read only")
    } else if ce.has(CeStatus::NON_SAM) {
        Some("foreign volume")
    } else if ce.has(CeStatus::NEEDS_AUDIT) {
        Some("slot needs audit")
    } else {
        None
    }
}

/// What the loaded medium says about being relabeled
fn check_loaded(drive: &Drive, req: &LabelRequest) -> Result<(), Errno> {
    let st = drive.unit.snapshot();
    let eq = drive.unit.eq;
    if st.status.intersects(UnitStatus::READ_ONLY | UnitStatus::WRITE_PROTECT) {
        warn!("eq {}: slot {} is write protected", eq, req.slot);
        return Err(Errno::EACCES);
    }
    if st.status.contains(UnitStatus::STRANGE) && !req.flags.contains(LabelFlags::RELABEL) {
        warn!("eq {}: slot {} holds foreign data", eq, req.slot);
        return Err(Errno::EACCES);
    }
    if st.status.contains(UnitStatus::LABELED) {
        if !req.flags.contains(LabelFlags::RELABEL) {
            warn!("eq {}: slot {} already labeled {}", eq, req.slot, st.vsn);
            return Err(Errno::EACCES);
        }
        if drive.unit.class == DeviceClass::Tape && st.media_worm {
            warn!("eq {}: WORM tape {} cannot be relabeled", eq, st.vsn);
            return Err(Errno::EACCES);
        }
        if let Some(old) = &req.old_vsn {
            if !old.is_empty() && *old != st.vsn {
                warn!("eq {}: old VSN {} does not match {}", eq, old, st.vsn);
                return Err(Errno::EACCES);
            }
        }
    }
    Ok(())
}

/// Reserve the VSN, write the labels and record the result.
///
/// The caller has the medium loaded, open and spun up.
pub(crate) fn write_and_record(
    lib: &Library,
    drive: &Drive,
    ce: &CatalogEntry,
    params: &LabelParams,
) -> Result<(), Errno> {
    let eq = drive.unit.eq;
    let catalog = &lib.ctx.catalog;
    let media = drive.unit.lock().media.unwrap_or(ce.media);
    if let Err(e) = catalog.label_volume(lib.eq, ce.slot, ce.partition, media, &params.vsn) {
        warn!("eq {}: cannot reserve {}: {}", eq, params.vsn, e);
        drive.unit.set_message(format!("{} already in use", params.vsn));
        return Err(Errno::EEXIST);
    }

    let result = {
        let _io = drive.unit.io_mutex.lock();
        let keep = drive.unit.status()
            & (UnitStatus::REQUESTED | UnitStatus::AUDIT | UnitStatus::OPENED);
        let result = match drive.unit.class {
            DeviceClass::Optical => labels::write_labels(drive.io.as_ref(), &drive.unit, params),
            _ => labels::write_tape_labels(
                drive.io.as_ref(),
                &drive.unit,
                params,
                lib.ctx.timing().tur_interval(),
            ),
        };
        drive.unit.lock().status |= keep;
        result
    };

    match result {
        Ok(()) => {}
        Err(LabelError::Volsafe) => {
            catalog.label_failed(lib.eq, ce.slot, ce.partition, &params.vsn);
            return Err(Errno::EACCES);
        }
        Err(e) => {
            error!("eq {}: label {} on slot {} failed: {}", eq, params.vsn, ce.slot, e);
            if let Err(ce_err) =
                catalog.set_status(lib.eq, ce.slot, ce.partition, CeStatus::BAD_MEDIA, true)
            {
                warn!("eq {}: cannot flag slot {} bad: {}", eq, ce.slot, ce_err);
            }
            catalog.label_failed(lib.eq, ce.slot, ce.partition, &params.vsn);
            return Err(Errno::EIO);
        }
    }

    scan::scan_a_device(&drive.unit, drive.io.as_ref());
    let info = {
        let mut st = drive.unit.lock();
        st.slot = Some(ce.slot);
        st.partition = ce.partition;
        volume_info(lib, &st)
    };
    if let Some(info) = info {
        if let Err(e) = catalog.update(&info, UpdateReason::LabelComplete) {
            warn!("eq {}: label of {} not recorded: {}", eq, params.vsn, e);
        }
    }
    info!("eq {}: labeled slot {} as {}", eq, ce.slot, params.vsn);
    Ok(())
}

/// Label an unlabeled medium with its barcode. The medium is loaded and
/// scanned.
pub(crate) fn auto_label(lib: &Library, drive: &Drive, ce: &CatalogEntry) -> bool {
    let vsn = vsn_from_barcode(
        &ce.barcode,
        lib.ctx.defaults().barcode_truncation,
        max_vsn_len(drive),
    );
    if vsn.is_empty() {
        return false;
    }
    info!("eq {}: labeling slot {} from barcode as {}", drive.unit.eq, ce.slot, vsn);
    write_and_record(lib, drive, ce, &LabelParams::new(&vsn)).is_ok()
}

fn finish(lib: &Library, drive: &Drive, event: Event, errno: Errno) {
    release_unit(drive);
    clear_requested(drive);
    if errno.is_ok() {
        let vsn = drive.unit.lock().vsn.clone();
        lib.ctx.previews.check_preview(&vsn);
    }
    event.dispose(errno);
}

/// Label the medium in `req.slot`
pub fn label_slot(lib: &Library, drive: &Drive, event: Event, req: &LabelRequest) {
    let eq = drive.unit.eq;
    let catalog = &lib.ctx.catalog;

    let Some(ce) = catalog
        .get_by_loc(lib.eq, req.slot, req.partition)
        .filter(|ce| ce.has(CeStatus::INUSE))
    else {
        warn!("eq {}: label: no volume in slot {}", eq, req.slot);
        clear_requested(drive);
        event.dispose(Errno::ENOENT);
        return;
    };
    let loaded_here = drive.lock().slot == Some(req.slot);
    if !ce.has(CeStatus::OCCUPIED)
        && !loaded_here
        && lib.drive_holding(req.slot, req.partition).is_none()
    {
        warn!("eq {}: label: slot {} is empty", eq, req.slot);
        clear_requested(drive);
        event.dispose(Errno::ENOENT);
        return;
    }
    if let Some(reason) = refuse_entry(&ce) {
        warn!("eq {}: label of slot {} refused: {}", eq, req.slot, reason);
        drive.unit.set_message(reason);
        clear_requested(drive);
        event.dispose(Errno::ENOENT);
        return;
    }

    if !drive.unit.wait_for_idle(lib.ctx.timing().delayed_requeue()) {
        info!("eq {}: busy, label of slot {} requeued", eq, req.slot);
        clear_requested(drive);
        lib.submit(event.delay(lib.ctx.timing().delayed_requeue()));
        return;
    }

    let loaded = {
        let mut d = drive.lock();
        media::get_media(lib, drive, &mut d, &ce).map(|()| d.bar_code.clone())
    };
    let bar_code = match loaded {
        Ok(bar_code) => bar_code,
        Err(err) => {
            error!("eq {}: label: load of slot {} failed: {:?}", eq, req.slot, err);
            release_unit(drive);
            clear_requested(drive);
            match err {
                GetMediaError::Requeued => {
                    lib.submit(event.delay(lib.ctx.timing().delayed_requeue()))
                }
                _ => event.dispose(Errno::EIO),
            }
            return;
        }
    };

    if let Err(err) = media::spin_drive(lib, drive, true) {
        error!("eq {}: label: spin up of slot {} failed: {:?}", eq, req.slot, err);
        close_unit(drive);
        if err != media::SpinError::DownEquipment {
            if let Err(e) = media::clear_drive(lib, drive) {
                warn!("eq {}: unload after failed spin up: {}", eq, e);
            }
        }
        finish(lib, drive, event, Errno::EIO);
        return;
    }
    scan::scan_a_device(&drive.unit, drive.io.as_ref());

    if let Err(errno) = check_loaded(drive, req) {
        finish(lib, drive, event, errno);
        return;
    }

    let vsn = if req.flags.contains(LabelFlags::BARCODE) {
        let barcode = bar_code.or_else(|| ce.has_barcode().then(|| ce.barcode.clone()));
        match barcode {
            Some(code) => vsn_from_barcode(
                &code,
                lib.ctx.defaults().barcode_truncation,
                max_vsn_len(drive),
            ),
            None => String::new(),
        }
    } else {
        req.vsn.clone()
    };
    if vsn.is_empty() || vsn.len() > max_vsn_len(drive) {
        warn!("eq {}: label: unusable VSN {:?}", eq, vsn);
        finish(lib, drive, event, Errno::EINVAL);
        return;
    }

    let params = LabelParams {
        vsn,
        info: req.info.clone(),
        block_size: req.block_size,
        flags: req.flags,
    };
    let errno = match write_and_record(lib, drive, &ce, &params) {
        Ok(()) => Errno::Ok,
        Err(errno) => errno,
    };
    finish(lib, drive, event, errno);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MediaType;
    use crate::config::{RobotConfig, Timing};
    use crate::event::{completion_channel, Command};
    use crate::sim::SimWorld;
    use std::sync::Arc;

    fn setup() -> (Arc<Library>, Arc<SimWorld>) {
        let config = RobotConfig {
            timing: Timing::fast(),
            ..Default::default()
        };
        let world = SimWorld::from_config(&config);
        let (lib, _) = Library::with_world(config, &world).unwrap();
        (lib, world)
    }

    fn request(slot: u32, vsn: &str, flags: LabelFlags) -> LabelRequest {
        LabelRequest {
            eq: 50,
            slot,
            partition: 0,
            media: MediaType::Lto,
            vsn: vsn.to_string(),
            old_vsn: None,
            info: None,
            block_size: 0,
            flags,
        }
    }

    fn label(lib: &Library, drive: &Drive, req: LabelRequest) -> Errno {
        let (tx, rx) = completion_channel();
        let event = Event::message(Command::Label(req.clone())).with_reply(tx);
        label_slot(lib, drive, event, &req);
        rx.try_recv().unwrap().errno
    }

    #[test]
    fn test_label_blank_tape() {
        let (lib, world) = setup();
        let drive = lib.drives[0].clone();
        assert_eq!(label(&lib, &drive, request(4, "NEW004", LabelFlags::empty())), Errno::Ok);

        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 4, 0).unwrap();
        assert_eq!(ce.vsn, "NEW004");
        assert!(ce.has(CeStatus::LABELED));
        assert!(world.tape_records(drive.element)[0].starts_with(b"VOL1NEW004"));
        let st = drive.unit.lock();
        assert_eq!(st.active, 0);
        assert!(!st.status.contains(UnitStatus::REQUESTED));
    }

    #[test]
    fn test_label_rejections() {
        let (lib, _) = setup();
        let drive = lib.drives[0].clone();
        // 已有标签且未要求重贴
        assert_eq!(label(&lib, &drive, request(1, "NEW001", LabelFlags::empty())), Errno::EACCES);
        // 旧 VSN 不符
        let mut req = request(1, "NEW001", LabelFlags::RELABEL);
        req.old_vsn = Some("WRONG1".into());
        assert_eq!(label(&lib, &drive, req), Errno::EACCES);
        // VSN 已被占用
        assert_eq!(label(&lib, &drive, request(5, "VSN002", LabelFlags::empty())), Errno::EEXIST);
        // 清洗带
        assert_eq!(label(&lib, &drive, request(9, "CLN", LabelFlags::empty())), Errno::ENOENT);
        // 空槽位
        assert_eq!(label(&lib, &drive, request(7, "EMPTY7", LabelFlags::empty())), Errno::ENOENT);
        assert_eq!(drive.unit.lock().active, 0);
    }

    #[test]
    fn test_relabel_with_old_vsn() {
        let (lib, _) = setup();
        let drive = lib.drives[0].clone();
        let mut req = request(1, "REL001", LabelFlags::RELABEL);
        req.old_vsn = Some("VSN001".into());
        assert_eq!(label(&lib, &drive, req), Errno::Ok);
        assert_eq!(lib.ctx.catalog.get_by_loc(lib.eq, 1, 0).unwrap().vsn, "REL001");
    }

    #[test]
    fn test_label_from_barcode() {
        let (lib, _) = setup();
        let drive = lib.drives[0].clone();
        assert_eq!(label(&lib, &drive, request(5, "", LabelFlags::BARCODE)), Errno::Ok);
        assert_eq!(lib.ctx.catalog.get_by_loc(lib.eq, 5, 0).unwrap().vsn, "VSN005");
    }

    #[test]
    fn test_write_protected_entry_is_enoent() {
        let (lib, _) = setup();
        let drive = lib.drives[0].clone();
        lib.ctx
            .catalog
            .set_status(lib.eq, 4, 0, CeStatus::WRITE_PROTECT, true)
            .unwrap();
        assert_eq!(label(&lib, &drive, request(4, "NEW004", LabelFlags::empty())), Errno::ENOENT);
    }
}
