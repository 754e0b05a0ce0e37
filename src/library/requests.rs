//! Request routing on the library thread
//!
//! Every inbound event is either resolved here or handed to exactly one
//! drive queue. Drive selection marks the drive `REQUESTED` before the
//! event is enqueued.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Library;
use crate::catalog::{CatalogEntry, CeStatus, MediaType};
use crate::device::{DeviceState, UnitStatus};
use crate::error::Errno;
use crate::event::{
    AuditRequest, CleanRequest, Command, Event, EventKind, InternalCommand, LabelRequest,
    MountFlags, MountRequest, StateChange,
};
use crate::labels::LabelFlags;

pub(crate) fn dispatch(lib: &Arc<Library>, event: Event) {
    match event.kind.clone() {
        EventKind::Internal(cmd) => match cmd {
            InternalCommand::StartAudit { eod } => lib.start_audit(Some(event), eod),
            InternalCommand::Shutdown => {
                event.dispose(Errno::Ok);
                lib.shutdown();
            }
            other => {
                warn!("library {}: unexpected internal event {:?}", lib.eq, other);
                event.dispose(Errno::EINVAL);
            }
        },
        EventKind::Message(msg) => {
            if !msg.is_valid() {
                warn!("library {}: bad message magic {:#x}", lib.eq, msg.magic);
                event.dispose(Errno::EINVAL);
                return;
            }
            debug!("library {}: {} request", lib.eq, msg.command.name());
            match msg.command {
                Command::Mount(req) => mount_request(lib, event, req),
                Command::Label(req) => label_request(lib, event, &req),
                Command::Clean(req) => clean_request(lib, event, req),
                Command::Audit(req) => audit_request(lib, event, req),
                Command::State(req) => state_request(lib, event, req),
                Command::Unload(req) => forward(lib, event, req.eq),
                Command::LoadUnavail(req) => forward(lib, event, req.eq),
                Command::Todo(req) => forward(lib, event, req.eq),
                Command::TapeAlert(req) => forward(lib, event, req.eq),
                Command::Sef(req) => forward(lib, event, req.eq),
                Command::Shutdown => {
                    info!("library {}: shutdown requested", lib.eq);
                    event.dispose(Errno::Ok);
                    lib.shutdown();
                }
            }
        }
    }
}

/// Hand a drive-addressed command to that drive
fn forward(lib: &Library, event: Event, eq: u16) {
    let Some(drive) = lib.drive_by_eq(eq) else {
        warn!("library {}: {} for unknown drive {}", lib.eq, event.describe(), eq);
        event.dispose(Errno::ENOENT);
        return;
    };
    let state = drive.unit.state();
    if state >= DeviceState::Off {
        info!(
            "library {}: {} refused, eq {} is {}",
            lib.eq,
            event.describe(),
            eq,
            state.description()
        );
        event.dispose(Errno::EIO);
        return;
    }
    drive.enqueue(event);
}

/// Give slot work to the drive holding the medium, else to an idle drive,
/// else try again later
fn route(lib: &Library, event: Event, slot: u32, partition: u8) {
    if let Some(drive) = lib.drive_holding(slot, partition) {
        if drive.unit.state() <= DeviceState::Idle {
            drive.unit.lock().status |= UnitStatus::REQUESTED;
            drive.enqueue(event);
            return;
        }
    }
    if let Some(drive) = lib.find_idle_drive() {
        debug!("library {}: slot {} to eq {}", lib.eq, slot, drive.unit.eq);
        drive.enqueue(event);
        return;
    }
    if lib.has_usable_drive() {
        debug!("library {}: no idle drive for slot {}, requeued", lib.eq, slot);
        lib.submit(event.delay(lib.ctx.timing().delayed_requeue()));
    } else {
        warn!("library {}: no usable drive for slot {}", lib.eq, slot);
        event.dispose(Errno::EAGAIN);
    }
}

/// Volume by VSN, optionally restricted to a media type
fn find_vsn(lib: &Library, vsn: &str, media: Option<MediaType>) -> Option<CatalogEntry> {
    let found = match media {
        Some(media) => lib
            .ctx
            .catalog
            .get_by_media(media, vsn)
            .filter(|ce| ce.eq == lib.eq),
        None => lib
            .ctx
            .catalog
            .entries(lib.eq)
            .into_iter()
            .find(|ce| ce.vsn == vsn),
    };
    found.filter(|ce| ce.has(CeStatus::INUSE))
}

fn mount_request(lib: &Library, mut event: Event, mut req: MountRequest) {
    if req.slot.is_none() && req.vsn.is_empty() {
        warn!("library {}: mount without VSN or slot", lib.eq);
        event.dispose(Errno::EINVAL);
        return;
    }
    let ce = match req.slot {
        Some(slot) => lib
            .ctx
            .catalog
            .get_by_loc(lib.eq, slot, req.partition)
            .filter(|ce| ce.has(CeStatus::INUSE)),
        None => find_vsn(lib, &req.vsn, req.media),
    };
    let Some(ce) = ce else {
        warn!("library {}: mount: {:?} not in library", lib.eq, req.vsn);
        event.dispose(Errno::ENOENT);
        return;
    };
    if ce.has(CeStatus::CLEANING) {
        warn!("library {}: mount: slot {} holds a cleaning cartridge", lib.eq, ce.slot);
        event.dispose(Errno::ENOENT);
        return;
    }

    if let Some(drive) = lib.drive_holding(ce.slot, ce.partition) {
        let ready = {
            let st = drive.unit.lock();
            st.status.contains(UnitStatus::READY) && st.vsn == ce.vsn
        };
        if ready && !req.flags.contains(MountFlags::MIGKIT) {
            info!("library {}: {} already mounted on eq {}", lib.eq, ce.vsn, drive.unit.eq);
            if let Some(entry) = lib.ctx.previews.find_by_vsn(&ce.vsn) {
                lib.ctx
                    .previews
                    .remove_preview_ent(&entry, Some(drive.unit.eq), Errno::Ok);
            }
            event.dispose(Errno::Ok);
            return;
        }
    }

    req.slot = Some(ce.slot);
    req.partition = ce.partition;
    req.media = Some(ce.media);
    if req.vsn.is_empty() {
        req.vsn = ce.vsn.clone();
    }
    if let EventKind::Message(msg) = &mut event.kind {
        msg.command = Command::Mount(req);
    }
    route(lib, event, ce.slot, ce.partition);
}

fn label_request(lib: &Library, event: Event, req: &LabelRequest) {
    let barcode_label = req.flags.contains(LabelFlags::BARCODE);
    let Some(ce) = lib
        .ctx
        .catalog
        .get_by_loc(lib.eq, req.slot, req.partition)
        .filter(|ce| ce.has(CeStatus::INUSE))
    else {
        warn!("library {}: label: no volume in slot {}", lib.eq, req.slot);
        event.dispose(Errno::ENOENT);
        return;
    };
    if barcode_label && !ce.has_barcode() {
        warn!("library {}: label: slot {} has no barcode", lib.eq, req.slot);
        event.dispose(Errno::EINVAL);
        return;
    }
    if !barcode_label && req.vsn.is_empty() {
        warn!("library {}: label: no VSN given for slot {}", lib.eq, req.slot);
        event.dispose(Errno::EINVAL);
        return;
    }
    if !req.vsn.is_empty() {
        let duplicate = lib
            .ctx
            .catalog
            .get_by_media(req.media, &req.vsn)
            .filter(|other| other.has(CeStatus::INUSE))
            .filter(|other| {
                other.eq != lib.eq || other.slot != req.slot || other.partition != req.partition
            });
        if let Some(other) = duplicate {
            warn!(
                "library {}: label: {} already in slot {} of eq {}",
                lib.eq, req.vsn, other.slot, other.eq
            );
            event.dispose(Errno::EEXIST);
            return;
        }
    }
    route(lib, event, req.slot, req.partition);
}

fn clean_request(lib: &Library, event: Event, req: CleanRequest) {
    let Some(drive) = lib.drive_by_eq(req.eq) else {
        warn!("library {}: clean of unknown drive {}", lib.eq, req.eq);
        event.dispose(Errno::ENOENT);
        return;
    };
    // 自动清洗排队时已置位，延迟事件是它自己
    if drive.cleaning_in_progress() && !event.flags.delayed {
        debug!("library {}: eq {} already scheduled for cleaning", lib.eq, req.eq);
        event.dispose(Errno::Ok);
        return;
    }
    drive.set_cleaning_in_progress(true);
    let state = drive.unit.state();
    if state >= DeviceState::Off {
        info!("library {}: clean refused, eq {} is {}", lib.eq, req.eq, state.description());
        drive.set_cleaning_in_progress(false);
        event.dispose(Errno::EIO);
        return;
    }
    drive.enqueue(event);
}

fn audit_request(lib: &Library, mut event: Event, req: AuditRequest) {
    let Some(slot) = req.slot else {
        lib.start_audit(Some(event), req.eod);
        return;
    };
    if lib.flags().audit {
        warn!("library {}: audit of slot {} during library audit", lib.eq, slot);
        event.dispose(Errno::EAGAIN);
        return;
    }
    if slot >= lib.storage_count || lib.ctx.catalog.get_by_loc(lib.eq, slot, 0).is_none() {
        warn!("library {}: audit: slot {} not in library", lib.eq, slot);
        event.dispose(Errno::ENOENT);
        return;
    }
    event.kind = EventKind::Internal(InternalCommand::AuditSlot { slot, eod: req.eod });
    route(lib, event, slot, 0);
}

fn state_request(lib: &Library, event: Event, req: StateChange) {
    if req.eq == lib.eq {
        let errno = match req.new_state {
            DeviceState::On | DeviceState::Off | DeviceState::Down => {
                let mut st = lib.unit.lock();
                st.state = req.new_state;
                st.set_message(req.new_state.description());
                info!("library {}: robot {}", lib.eq, req.new_state.description());
                Errno::Ok
            }
            other => {
                warn!("library {}: robot cannot go {}", lib.eq, other.description());
                Errno::EINVAL
            }
        };
        lib.unit.notify();
        event.dispose(errno);
        return;
    }
    let Some(drive) = lib.drive_by_eq(req.eq) else {
        warn!("library {}: state change for unknown eq {}", lib.eq, req.eq);
        event.dispose(Errno::ENOENT);
        return;
    };
    drive.unit.lock().status |= UnitStatus::REQUESTED;
    drive.enqueue(event);
}

/// Serve pending preview entries: each is claimed once and sent to the
/// drive holding its volume or to an idle drive.
pub(crate) fn check_requests(lib: &Arc<Library>) {
    if lib.flags().audit {
        return;
    }
    let previews = &lib.ctx.previews;
    for entry in previews.pending() {
        let (vsn, media) = {
            let st = entry.lock();
            (st.vsn.clone(), st.media)
        };
        if vsn.is_empty() {
            continue;
        }
        let Some(ce) = find_vsn(lib, &vsn, media).filter(|ce| !ce.has(CeStatus::CLEANING)) else {
            continue;
        };
        let Some(sequence) = previews.try_claim(&entry) else {
            continue;
        };

        let holder = lib
            .drive_holding(ce.slot, ce.partition)
            .filter(|d| d.queue_is_empty() && d.unit.state() <= DeviceState::Idle);
        let drive = match holder {
            Some(drive) => {
                drive.unit.lock().status |= UnitStatus::REQUESTED;
                Some(drive)
            }
            None => lib.find_idle_drive(),
        };
        let Some(drive) = drive else {
            debug!("library {}: no drive for {} yet", lib.eq, vsn);
            previews.clear_busy(&entry);
            continue;
        };

        {
            let mut st = entry.lock();
            st.robot_equ = Some(lib.eq);
            st.slot = Some(ce.slot);
        }
        info!(
            "library {}: {} from slot {} to eq {}",
            lib.eq, vsn, ce.slot, drive.unit.eq
        );
        drive.enqueue(Event::internal(InternalCommand::Mount {
            slot: ce.slot,
            partition: ce.partition,
            preview: Some((entry.clone(), sequence)),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MediaType;
    use crate::config::{RobotConfig, Timing};
    use crate::event::{completion_channel, Completion, UnloadRequest};
    use crate::sim::SimWorld;
    use crossbeam::channel::unbounded;

    fn setup() -> (Arc<Library>, Arc<SimWorld>) {
        let config = RobotConfig {
            timing: Timing::fast(),
            ..Default::default()
        };
        let world = SimWorld::from_config(&config);
        let (lib, _) = Library::with_world(config, &world).unwrap();
        (lib, world)
    }

    fn send(lib: &Arc<Library>, command: Command) -> crossbeam::channel::Receiver<Completion> {
        let (tx, rx) = completion_channel();
        dispatch(lib, Event::message(command).with_reply(tx));
        rx
    }

    fn drain(lib: &Library) -> usize {
        let mut n = 0;
        for drive in &lib.drives {
            for ev in drive.drain_queue_except(|_| false) {
                ev.dispose(Errno::ECANCELED);
                n += 1;
            }
        }
        n
    }

    #[test]
    fn test_mount_routes_to_idle_drive() {
        let (lib, _) = setup();
        let rx = send(
            &lib,
            Command::Mount(MountRequest {
                eq: lib.eq,
                vsn: "VSN001".into(),
                media: Some(MediaType::Lto),
                ..Default::default()
            }),
        );
        assert!(rx.try_recv().is_err());
        let drive = lib
            .drives
            .iter()
            .find(|d| d.queue_len() == 1)
            .unwrap()
            .clone();
        assert!(drive.unit.status().contains(UnitStatus::REQUESTED));
        let ev = drive.drain_queue_except(|_| false).pop().unwrap();
        match &ev.kind {
            EventKind::Message(msg) => match &msg.command {
                Command::Mount(req) => assert_eq!(req.slot, Some(1)),
                other => panic!("unexpected {:?}", other),
            },
            _ => panic!("not a message"),
        }
        ev.dispose(Errno::Ok);
    }

    #[test]
    fn test_mount_rejections() {
        let (lib, _) = setup();
        let rx = send(
            &lib,
            Command::Mount(MountRequest {
                eq: lib.eq,
                vsn: "NOSUCH".into(),
                ..Default::default()
            }),
        );
        assert_eq!(rx.try_recv().unwrap().errno, Errno::ENOENT);
        let rx = send(
            &lib,
            Command::Mount(MountRequest {
                eq: lib.eq,
                slot: Some(9),
                ..Default::default()
            }),
        );
        assert_eq!(rx.try_recv().unwrap().errno, Errno::ENOENT);
        assert_eq!(drain(&lib), 0);
    }

    #[test]
    fn test_label_request_checks() {
        let (lib, _) = setup();
        let label = |slot: u32, vsn: &str, flags: LabelFlags| {
            Command::Label(LabelRequest {
                eq: lib.eq,
                slot,
                media: MediaType::Lto,
                vsn: vsn.into(),
                flags,
                ..Default::default()
            })
        };
        let errno = |command| send(&lib, command).try_recv().map(|c| c.errno).ok();
        assert_eq!(errno(label(4, "VSN001", LabelFlags::empty())), Some(Errno::EEXIST));
        assert_eq!(errno(label(4, "", LabelFlags::empty())), Some(Errno::EINVAL));
        assert_eq!(errno(label(7, "NEW007", LabelFlags::empty())), Some(Errno::ENOENT));
        assert_eq!(errno(label(4, "", LabelFlags::BARCODE)), None);
        assert_eq!(drain(&lib), 1);
    }

    #[test]
    fn test_duplicate_clean_is_noop() {
        let (lib, _) = setup();
        let eq = lib.drives[0].unit.eq;
        let clean = |eq| send(&lib, Command::Clean(CleanRequest { eq })).try_recv().ok();
        assert!(clean(eq).is_none());
        assert_eq!(clean(eq).unwrap().errno, Errno::Ok);
        assert_eq!(lib.drives[0].queue_len(), 1);
        assert_eq!(clean(999).unwrap().errno, Errno::ENOENT);
        drain(&lib);
    }

    #[test]
    fn test_forward_and_state() {
        let (lib, _) = setup();
        let rx = send(&lib, Command::Unload(UnloadRequest { eq: 999 }));
        assert_eq!(rx.try_recv().unwrap().errno, Errno::ENOENT);

        let rx = send(
            &lib,
            Command::State(StateChange {
                eq: lib.eq,
                old_state: DeviceState::On,
                new_state: DeviceState::Off,
            }),
        );
        assert_eq!(rx.try_recv().unwrap().errno, Errno::Ok);
        assert_eq!(lib.unit.state(), DeviceState::Off);
        let rx = send(
            &lib,
            Command::State(StateChange {
                eq: lib.eq,
                old_state: DeviceState::Off,
                new_state: DeviceState::Idle,
            }),
        );
        assert_eq!(rx.try_recv().unwrap().errno, Errno::EINVAL);

        let drive = lib.drives[1].clone();
        send(
            &lib,
            Command::State(StateChange {
                eq: drive.unit.eq,
                old_state: DeviceState::On,
                new_state: DeviceState::Off,
            }),
        );
        assert!(drive.unit.status().contains(UnitStatus::REQUESTED));
        assert_eq!(drain(&lib), 1);
    }

    #[test]
    fn test_audit_slot_becomes_internal() {
        let (lib, _) = setup();
        let audit = |slot, eod| Command::Audit(AuditRequest { eq: lib.eq, slot: Some(slot), eod });
        assert_eq!(send(&lib, audit(50, false)).try_recv().unwrap().errno, Errno::ENOENT);
        send(&lib, audit(2, true));
        let ev = lib
            .drives
            .iter()
            .flat_map(|d| d.drain_queue_except(|_| false))
            .next()
            .unwrap();
        assert!(matches!(
            ev.kind,
            EventKind::Internal(InternalCommand::AuditSlot { slot: 2, eod: true })
        ));
        ev.dispose(Errno::Ok);
    }

    #[test]
    fn test_check_requests_claims_once() {
        let (lib, _) = setup();
        let (tx, _rx) = unbounded();
        let entry = lib.ctx.previews.add("VSN002", None, false, tx);
        check_requests(&lib);
        check_requests(&lib);
        assert!(entry.snapshot().busy);
        assert_eq!(entry.snapshot().slot, Some(2));
        assert_eq!(drain(&lib), 1);
    }

    #[test]
    fn test_check_requests_without_drive_releases_busy() {
        let (lib, _) = setup();
        for drive in &lib.drives {
            drive.unit.lock().state = DeviceState::Off;
        }
        let (tx, _rx) = unbounded();
        let entry = lib.ctx.previews.add("VSN002", None, false, tx);
        check_requests(&lib);
        assert!(!entry.snapshot().busy);
        assert_eq!(drain(&lib), 0);
    }
}
