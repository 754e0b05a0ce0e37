//! Drive cleaning
//!
//! 清洗流程：卸下当前介质，装入清洗带，等清洗周期结束后退回槽位，
//! 最后更新清洗带的剩余次数。

use chrono::Utc;
use std::thread;
use tracing::{debug, error, info, warn};

use super::{down_drive, media, Drive, DriveStatus};
use crate::catalog::{CatalogEntry, CatalogField, CeStatus};
use crate::device::{DriveModel, UnitStatus};
use crate::error::Errno;
use crate::event::Event;
use crate::library::Library;
use crate::scsi::SenseClass;
use crate::transport::CleanPolicy;

fn finish(drive: &Drive, event: Event, errno: Errno) {
    drive.set_cleaning_in_progress(false);
    {
        let mut st = drive.unit.lock();
        drive.unit.release(&mut st);
    }
    event.dispose(errno);
}

fn load_cleaner(
    lib: &Library,
    drive: &Drive,
    ce: &CatalogEntry,
    policy: &CleanPolicy,
) -> Result<(), String> {
    let src = lib.slot_element(ce.slot);
    let mut last = String::new();
    for attempt in 1..=policy.load_attempts.max(1) {
        match lib
            .transport
            .move_media(lib.transport_element, src, drive.element, false)
        {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    "eq {}: cleaning cartridge load failed (attempt {}): {}",
                    drive.unit.eq, attempt, e
                );
                last = e.to_string();
                if attempt < policy.load_attempts {
                    thread::sleep(policy.load_backoff);
                }
            }
        }
    }
    Err(last)
}

/// Wait out one cleaning cycle. Returns true if the cartridge reported a
/// medium error.
fn wait_cycle(lib: &Library, drive: &Drive, policy: &CleanPolicy) -> bool {
    let timing = lib.ctx.timing();
    if drive.unit.model == DriveModel::Ibm3570 {
        for _ in 0..timing.tur_retries.saturating_mul(10) {
            match drive.io.test_unit_ready() {
                Ok(()) => return false,
                Err(e) => match e.class() {
                    SenseClass::MediumError => return true,
                    SenseClass::CleaningInProgress | SenseClass::NotReady => {
                        thread::sleep(timing.tur_interval())
                    }
                    _ => return false,
                },
            }
        }
        return false;
    }

    thread::sleep(policy.cycle);
    match drive.io.test_unit_ready() {
        Err(e) if e.class() == SenseClass::MediumError => true,
        Err(e) => {
            debug!("eq {}: TUR after cleaning cycle: {}", drive.unit.eq, e);
            false
        }
        Ok(()) => false,
    }
}

/// Clean the drive with a cleaning cartridge from its library.
pub fn clean(lib: &Library, drive: &Drive, event: Event) {
    let eq = drive.unit.eq;
    let catalog = &lib.ctx.catalog;
    let policy = lib
        .transport
        .kind()
        .clean_policy(lib.ctx.timing(), lib.ctx.defaults());

    drive.unit.lock().inc_active();
    if let Err(e) = media::clear_drive(lib, drive) {
        error!("eq {}: cannot empty drive for cleaning: {}", eq, e);
        drive.unit.lock().status |= UnitStatus::CLEANING;
        finish(drive, event, Errno::ENOENT);
        return;
    }
    {
        let mut st = drive.unit.lock();
        st.status |= UnitStatus::REQUESTED | UnitStatus::CLEANING;
        st.set_message("cleaning");
    }

    let Some(ce) = catalog.get_cleaning_volume(lib.eq) else {
        warn!("eq {}: no cleaning cartridge available", eq);
        down_drive(drive, "no cleaning cartridge available");
        drive.unit.set_message("no cleaning cartridge available");
        finish(drive, event, Errno::EAGAIN);
        return;
    };

    info!("eq {}: cleaning with slot {} ({} uses left)", eq, ce.slot, ce.access);
    lib.set_occupied(ce.slot, false);
    if let Err(e) = load_cleaner(lib, drive, &ce, &policy) {
        lib.set_occupied(ce.slot, true);
        down_drive(drive, &format!("cleaning cartridge load failed: {}", e));
        finish(drive, event, Errno::EIO);
        return;
    }
    let element = lib.slot_element(ce.slot);
    *drive.lock() = DriveStatus {
        full: true,
        valid: true,
        invert: false,
        media_element: Some(element),
        slot: Some(ce.slot),
        partition: ce.partition,
        bar_code: ce.has_barcode().then(|| ce.barcode.clone()),
    };

    let remaining = ce.access.saturating_sub(1);
    for field in [
        CatalogField::Access(remaining),
        CatalogField::MountTime(Utc::now().timestamp()),
    ] {
        if let Err(e) = catalog.set_field(lib.eq, ce.slot, ce.partition, field) {
            warn!("eq {}: cleaning cartridge slot {} not updated: {}", eq, ce.slot, e);
        }
    }

    let mut bad = false;
    let mut unloaded = false;
    for attempt in 1..=policy.unload_attempts {
        if wait_cycle(lib, drive, &policy) {
            error!("eq {}: media error on cleaning cartridge in slot {}", eq, ce.slot);
            bad = true;
            drive.unit.lock().status |= UnitStatus::BAD_MEDIA;
        }
        if let Err(e) = drive.io.start_stop(false, true) {
            debug!("eq {}: eject cleaning cartridge: {}", eq, e);
        }
        match lib
            .transport
            .move_media(lib.transport_element, drive.element, element, false)
        {
            Ok(()) => {
                unloaded = true;
                break;
            }
            Err(e) => warn!(
                "eq {}: cleaning cartridge unload failed (attempt {}/{}): {}",
                eq, attempt, policy.unload_attempts, e
            ),
        }
    }
    if !unloaded {
        down_drive(drive, "cleaning cartridge could not be unloaded");
        finish(drive, event, Errno::EIO);
        return;
    }

    *drive.lock() = DriveStatus::default();
    lib.set_occupied(ce.slot, true);
    if bad {
        if let Err(e) = catalog.set_status(lib.eq, ce.slot, ce.partition, CeStatus::BAD_MEDIA, true)
        {
            warn!("eq {}: cannot flag cleaning cartridge bad: {}", eq, e);
        }
    }

    {
        let mut st = drive.unit.lock();
        if bad {
            // 驱动器仍需清洗，换一盘清洗带再来
            st.status.remove(UnitStatus::REQUESTED | UnitStatus::BAD_MEDIA);
            st.set_message("cleaning cartridge bad");
        } else {
            st.status.remove(UnitStatus::CLEANING | UnitStatus::REQUESTED);
            st.set_message("cleaning complete");
        }
    }

    if remaining == 0 || bad {
        warn!("eq {}: cleaning cartridge in slot {} has expired", eq, ce.slot);
        if policy.export_expired {
            if let Err(e) = catalog.schedule_export(lib.eq, ce.slot) {
                warn!("eq {}: export of slot {} failed: {}", eq, ce.slot, e);
            }
        }
    }
    info!("eq {}: cleaning finished", eq);
    finish(drive, event, Errno::Ok);
    lib.request_check();
}
