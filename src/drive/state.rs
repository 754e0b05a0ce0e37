//! Operator state changes and device toggles

use tracing::{debug, error, info, warn};

use super::{
    clear_requested, close_unit, down_drive, media, release_unit, scan, volume_info, Drive,
};
use crate::catalog::{CeStatus, UpdateReason};
use crate::device::{DeviceClass, DeviceState, UnitStatus};
use crate::error::Errno;
use crate::event::{Event, LoadRequest, SefRequest, StateChange, ToggleRequest};
use crate::library::Library;

fn set_state(drive: &Drive, state: DeviceState) {
    let mut st = drive.unit.lock();
    st.state = state;
    st.set_message(state.description());
    drop(st);
    drive.unit.notify();
}

fn to_on(lib: &Library, drive: &Drive) {
    let eq = drive.unit.eq;
    {
        let mut st = drive.unit.lock();
        st.state = DeviceState::On;
        st.set_message("attempting to on device");
        st.clear_fields();
        if st.open_count > 0 {
            drive.io.close();
        }
        st.open_count = 0;
        st.status = UnitStatus::REQUESTED;
    }
    if drive.unit.class == DeviceClass::Optical {
        let _io = drive.unit.io_mutex.lock();
        if let Err(e) = drive.io.reset() {
            warn!("eq {}: reset failed: {}", eq, e);
        }
    }
    // 驱动器离线期间可能被手工装入介质，重新询问机械手
    *drive.lock() = Default::default();
    media::init_drive(lib, drive);
    if drive.unit.state() != DeviceState::On {
        warn!("eq {}: drive did not come on", eq);
        return;
    }
    {
        let mut st = drive.unit.lock();
        st.active = 0;
        st.open_count = 0;
        st.status |= UnitStatus::PRESENT;
        st.status.remove(UnitStatus::REQUESTED);
        if st.dis_mes == "attempting to on device" {
            st.set_message(DeviceState::On.description());
        }
    }
    drive.unit.notify();
    lib.request_check();
}

fn to_off(lib: &Library, drive: &Drive, state: DeviceState) {
    if let Err(e) = media::clear_drive(lib, drive) {
        // clear_drive 失败时驱动器已被置为 down
        error!("eq {}: unload before {} failed: {}", drive.unit.eq, state.description(), e);
        return;
    }
    set_state(drive, state);
}

/// Move an idle drive nobody is using to `Off`
pub(crate) fn idle_to_off(lib: &Library, drive: &Drive) {
    let idle = {
        let st = drive.unit.lock();
        st.state == DeviceState::Idle && st.active == 0
    };
    if idle {
        info!("eq {}: idle drive going off", drive.unit.eq);
        to_off(lib, drive, DeviceState::Off);
    }
}

/// Apply an operator state change. The declared old state must match.
pub fn drive_state_change(lib: &Library, drive: &Drive, event: Event, req: &StateChange) {
    let eq = drive.unit.eq;
    let current = drive.unit.state();
    if req.old_state != current {
        warn!(
            "eq {}: Invalid state change {} -> {}, drive is {}",
            eq,
            req.old_state.description(),
            req.new_state.description(),
            current.description()
        );
        clear_requested(drive);
        event.dispose(Errno::EINVAL);
        return;
    }

    let errno = match (current, req.new_state) {
        (from, to) if from == to => Errno::Ok,
        (DeviceState::Idle | DeviceState::Unavail | DeviceState::Off, DeviceState::On) => {
            to_on(lib, drive);
            Errno::Ok
        }
        (DeviceState::On, DeviceState::Idle) => {
            set_state(drive, DeviceState::Idle);
            idle_to_off(lib, drive);
            Errno::Ok
        }
        (_, DeviceState::Off) => {
            to_off(lib, drive, DeviceState::Off);
            Errno::Ok
        }
        (from, DeviceState::Unavail) if from != DeviceState::Down => {
            to_off(lib, drive, DeviceState::Unavail);
            Errno::Ok
        }
        (_, DeviceState::Down) => {
            down_drive(drive, "set down by operator");
            Errno::Ok
        }
        (DeviceState::On, DeviceState::Ro) => {
            set_state(drive, DeviceState::Ro);
            Errno::Ok
        }
        (from, to) => {
            warn!(
                "eq {}: Invalid state change {} -> {}",
                eq,
                from.description(),
                to.description()
            );
            Errno::EINVAL
        }
    };
    if errno.is_ok() {
        info!(
            "eq {}: state {} -> {}",
            eq,
            current.description(),
            drive.unit.state().description()
        );
    }
    clear_requested(drive);
    event.dispose(errno);
}

/// Load a volume into a drive held `Unavail` for maintenance
pub fn load_unavail(lib: &Library, drive: &Drive, event: Event, req: &LoadRequest) {
    let eq = drive.unit.eq;
    if drive.unit.state() != DeviceState::Unavail {
        warn!("eq {}: load of slot {} refused, drive not unavailable", eq, req.slot);
        event.dispose(Errno::EINVAL);
        return;
    }
    let Some(ce) = lib
        .ctx
        .catalog
        .get_by_loc(lib.eq, req.slot, req.partition)
        .filter(|ce| ce.has(CeStatus::INUSE))
    else {
        warn!("eq {}: load: no volume in slot {}", eq, req.slot);
        event.dispose(Errno::EINVAL);
        return;
    };

    let loaded = {
        let mut d = drive.lock();
        media::get_media(lib, drive, &mut d, &ce)
    };
    if let Err(err) = loaded {
        error!("eq {}: load of slot {} failed: {:?}", eq, req.slot, err);
        release_unit(drive);
        event.dispose(Errno::EIO);
        return;
    }
    if let Err(err) = media::spin_drive(lib, drive, true) {
        error!("eq {}: spin up of slot {} failed: {:?}", eq, req.slot, err);
        close_unit(drive);
        release_unit(drive);
        event.dispose(Errno::EIO);
        return;
    }

    scan::scan_a_device(&drive.unit, drive.io.as_ref());
    if let Some(info) = volume_info(lib, &drive.unit.lock()) {
        if let Err(e) = lib.ctx.catalog.update(&info, UpdateReason::VolumeLoaded) {
            warn!("eq {}: load of slot {} not recorded: {}", eq, req.slot, e);
        }
    }
    info!("eq {}: slot {} loaded while unavailable", eq, req.slot);
    release_unit(drive);
    event.dispose(Errno::Ok);
}

pub fn tapealert(drive: &Drive, event: Event, req: &ToggleRequest) {
    match drive.io.set_tapealert(req.enable) {
        Ok(()) => {
            drive.unit.lock().tapealert = req.enable;
            debug!("eq {}: TapeAlert {}", drive.unit.eq, req.enable);
            event.dispose(Errno::Ok);
        }
        Err(e) => {
            warn!("eq {}: TapeAlert mode select failed: {}", drive.unit.eq, e);
            event.dispose(Errno::EIO);
        }
    }
}

/// Sector error frequency logging
pub fn sef(drive: &Drive, event: Event, req: &SefRequest) {
    match drive.io.set_sef(req.enable, req.interval) {
        Ok(()) => {
            drive.unit.lock().sef_interval = req.enable.then_some(req.interval);
            event.dispose(Errno::Ok);
        }
        Err(e) => {
            warn!("eq {}: SEF mode select failed: {}", drive.unit.eq, e);
            event.dispose(Errno::EIO);
        }
    }
}
