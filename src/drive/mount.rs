//! Mount protocol
//!
//! 八个步骤：校验请求、查目录、装带、上电、扫描、清洗检查、
//! 通知预览请求者、收尾。每条路径都恰好处置事件一次。

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{
    clear_requested, close_unit, label, media, release_unit, scan, volume_info, Drive,
    GetMediaError, SpinError,
};
use crate::catalog::{CatalogEntry, CeStatus, MediaType, UpdateReason};
use crate::device::{DeviceState, UnitStatus};
use crate::error::Errno;
use crate::event::{Event, MountFlags, MountRequest};
use crate::labels::{vsn_from_barcode, LEN_OPTIC_VSN, LEN_TAPE_VSN};
use crate::library::Library;
use crate::preview::PreviewEntry;

/// One mount, from either a message or a claimed preview entry
#[derive(Debug, Clone)]
pub struct MountJob {
    pub slot: Option<u32>,
    pub partition: u8,
    pub media: Option<MediaType>,
    pub vsn: String,
    pub flags: MountFlags,
    pub preview: Option<(Arc<PreviewEntry>, u64)>,
}

impl MountJob {
    pub fn from_request(req: &MountRequest) -> Self {
        Self {
            slot: req.slot,
            partition: req.partition,
            media: req.media,
            vsn: req.vsn.clone(),
            flags: req.flags,
            preview: None,
        }
    }

    /// The VSN and media come from the entry itself when the drive gets to it
    pub fn for_preview(slot: u32, partition: u8, preview: Option<(Arc<PreviewEntry>, u64)>) -> Self {
        let (vsn, media, write) = match &preview {
            Some((entry, _)) => {
                let st = entry.snapshot();
                (st.vsn, st.media, st.write)
            }
            None => (String::new(), None, false),
        };
        Self {
            slot: Some(slot),
            partition,
            media,
            vsn,
            flags: if write { MountFlags::WRITE } else { MountFlags::empty() },
            preview,
        }
    }

    fn entry(&self) -> Option<&Arc<PreviewEntry>> {
        self.preview.as_ref().map(|(entry, _)| entry)
    }
}

/// Drop the request without touching any media
fn give_up(lib: &Library, drive: &Drive, job: &MountJob, event: Event, errno: Errno) {
    if let Some(entry) = job.entry() {
        lib.ctx.previews.clear_busy(entry);
    }
    clear_requested(drive);
    event.dispose(errno);
}

fn lookup(lib: &Library, slot: u32, job: &MountJob) -> Option<CatalogEntry> {
    lib.ctx
        .catalog
        .get_by_loc(lib.eq, slot, job.partition)
        .filter(|ce| ce.has(CeStatus::INUSE))
}

/// VSN shown for media the system does not own
fn foreign_vsn(lib: &Library, ce: &CatalogEntry) -> String {
    if ce.has_barcode() {
        let max = if ce.media.is_tape() { LEN_TAPE_VSN } else { LEN_OPTIC_VSN };
        vsn_from_barcode(&ce.barcode, lib.ctx.defaults().barcode_truncation, max)
    } else if !ce.vsn.is_empty() {
        ce.vsn.clone()
    } else {
        format!("{:06}", ce.slot)
    }
}

/// Unlabeled, writable, barcoded media a writer asked for get labeled on
/// the spot
pub(crate) fn should_auto_label(lib: &Library, drive: &Drive, ce: &CatalogEntry, write: bool) -> bool {
    if ce.ptoc_fwa != 0 || !ce.has_barcode() || !write || !lib.ctx.defaults().label_barcode {
        return false;
    }
    if ce.has(
        CeStatus::READ_ONLY
            | CeStatus::UNAVAIL
            | CeStatus::WRITE_PROTECT
            | CeStatus::NON_SAM
            | CeStatus::BAD_MEDIA,
    ) {
        return false;
    }
    let status = drive.unit.status();
    if !status.contains(UnitStatus::READY)
        || status.intersects(
            UnitStatus::READ_ONLY
                | UnitStatus::WRITE_PROTECT
                | UnitStatus::LABELED
                | UnitStatus::CLEANING
                | UnitStatus::BAD_MEDIA
                | UnitStatus::STRANGE,
        )
    {
        return false;
    }
    if ce.label_time != 0 {
        error!(
            "eq {}: apparent unlabeled tape has active label_time (slot {})",
            drive.unit.eq, ce.slot
        );
        drive
            .unit
            .set_message(format!("slot {}: unlabeled media with label time", ce.slot));
        return false;
    }
    true
}

/// Load, spin up and scan the requested volume, then tell whoever asked.
pub fn mount(lib: &Library, drive: &Drive, event: Event, job: MountJob) {
    let eq = drive.unit.eq;
    let previews = &lib.ctx.previews;
    let catalog = &lib.ctx.catalog;

    // 1
    let Some(slot) = job.slot else {
        warn!("eq {}: mount of {:?} without a slot", eq, job.vsn);
        give_up(lib, drive, &job, event, Errno::Ok);
        return;
    };
    let state = drive.unit.state();
    if state > DeviceState::Idle {
        info!("eq {}: mount of slot {} refused, drive is {}", eq, slot, state.description());
        give_up(lib, drive, &job, event, Errno::Ok);
        return;
    }

    // 2
    let Some(ce) = lookup(lib, slot, &job) else {
        warn!("eq {}: no catalog entry for slot {} ({:?})", eq, slot, job.vsn);
        give_up(lib, drive, &job, event, Errno::Ok);
        return;
    };

    // 3
    let loaded = {
        let mut d = drive.lock();
        media::get_media(lib, drive, &mut d, &ce)
    };
    if let Err(err) = loaded {
        error!("eq {}: mount of {} from slot {} failed: {:?}", eq, ce.vsn, ce.slot, err);
        drive.unit.lock().vsn.clear();
        if let Some(entry) = job.entry() {
            match err {
                GetMediaError::BadMedia | GetMediaError::RetError => {
                    previews.remove_preview_ent(entry, None, Errno::EIO);
                }
                _ => previews.clear_busy(entry),
            }
        }
        release_unit(drive);
        clear_requested(drive);
        match err {
            GetMediaError::Requeued if event.is_message() => {
                lib.submit(event.delay(lib.ctx.timing().delayed_requeue()));
            }
            GetMediaError::Dispose | GetMediaError::RetError => event.dispose(Errno::EIO),
            _ => event.dispose(Errno::Ok),
        }
        return;
    }

    // 4
    if let Err(err) = media::spin_drive(lib, drive, true) {
        error!("eq {}: spin up of {} failed: {:?}", eq, ce.vsn, err);
        if let Some(entry) = job.entry() {
            if err == SpinError::BadMedia {
                previews.remove_preview_ent(entry, None, Errno::EIO);
            } else {
                previews.clear_busy(entry);
            }
        }
        close_unit(drive);
        if err != SpinError::DownEquipment {
            if let Err(e) = media::clear_drive(lib, drive) {
                warn!("eq {}: unload after failed spin up: {}", eq, e);
            }
        }
        release_unit(drive);
        clear_requested(drive);
        event.dispose(if err == SpinError::DownEquipment {
            Errno::Ok
        } else {
            Errno::EIO
        });
        return;
    }

    // 5
    let foreign = ce.has(CeStatus::NON_SAM);
    if !foreign {
        {
            let mut st = drive.unit.lock();
            st.vsn = ce.vsn.clone();
            st.partition = ce.partition;
        }
        scan::scan_a_device(&drive.unit, drive.io.as_ref());
        {
            let mut st = drive.unit.lock();
            if drive.unit.is_tape()
                && st.status.contains(UnitStatus::LABELED)
                && ce.has(CeStatus::LABELED)
                && st.vsn == ce.vsn
            {
                st.space = ce.space.min(st.capacity);
                if st.space == 0 {
                    st.status |= UnitStatus::STOR_FULL;
                }
            }
            if ce.has(CeStatus::READ_ONLY) {
                st.status |= UnitStatus::READ_ONLY;
            }
        }
        if let Some(info) = volume_info(lib, &drive.unit.lock()) {
            if let Err(e) = catalog.update(&info, UpdateReason::VolumeLoaded) {
                warn!("eq {}: load of {} not recorded: {}", eq, info.vsn, e);
            }
        }
    } else {
        let vsn = foreign_vsn(lib, &ce);
        let mut st = drive.unit.lock();
        st.vsn = vsn;
        st.status |= UnitStatus::READ_ONLY
            | UnitStatus::READY
            | UnitStatus::PRESENT
            | UnitStatus::STRANGE;
        st.status.remove(UnitStatus::SCANNING | UnitStatus::LABELED);
        st.set_message("foreign media");
    }

    // 6
    if drive.unit.status().contains(UnitStatus::CLEANING) {
        info!("eq {}: drive needs cleaning, {} returned", eq, ce.vsn);
        close_unit(drive);
        if let Err(e) = media::clear_drive(lib, drive) {
            warn!("eq {}: unload before cleaning failed: {}", eq, e);
        }
        if let Some(entry) = job.entry() {
            previews.clear_busy(entry);
        }
        release_unit(drive);
        clear_requested(drive);
        event.dispose(Errno::Ok);
        return;
    }

    // 7
    if let Some((entry, sequence)) = &job.preview {
        let snap = entry.snapshot();
        if snap.sequence != *sequence {
            info!(
                "eq {}: preview {} changed while mounting (sequence {} now {})",
                eq, entry.id, sequence, snap.sequence
            );
            release_unit(drive);
            clear_requested(drive);
            let vsn = drive.unit.lock().vsn.clone();
            previews.check_preview(&vsn);
            event.dispose(Errno::Ok);
            return;
        }
        if !snap.busy {
            warn!("eq {}: preview busy bit not set while mounting", eq);
            entry.lock().busy = true;
        }

        if should_auto_label(lib, drive, &ce, snap.write) && label::auto_label(lib, drive, &ce) {
            info!("eq {}: slot {} labeled from barcode", eq, ce.slot);
        }

        let st = drive.unit.snapshot();
        let labeled = st.status.contains(UnitStatus::LABELED);
        if snap.p_error {
            previews.remove_preview_ent(entry, None, Errno::ECANCELED);
        } else if snap.write
            && (foreign || st.status.intersects(UnitStatus::READ_ONLY | UnitStatus::WRITE_PROTECT))
        {
            previews.remove_preview_ent(entry, None, Errno::EACCES);
        } else if !labeled && !foreign {
            warn!("eq {}: slot {} is not labeled", eq, ce.slot);
            if let Err(e) = catalog.set_status(lib.eq, ce.slot, ce.partition, CeStatus::BAD_MEDIA, true)
            {
                warn!("eq {}: cannot flag slot {} bad: {}", eq, ce.slot, e);
            }
            previews.remove_preview_ent(entry, None, Errno::ENOSPC);
        } else if !snap.vsn.is_empty() && snap.vsn != st.vsn {
            warn!(
                "eq {}: wanted {} but slot {} holds {}",
                eq, snap.vsn, ce.slot, st.vsn
            );
            {
                let mut ps = entry.lock();
                ps.busy = false;
                ps.robot_equ = None;
                ps.slot = None;
            }
            previews.check_preview(&st.vsn);
        } else {
            drive.unit.lock().mtime = Utc::now().timestamp();
            previews.remove_preview_ent(entry, Some(eq), Errno::Ok);
        }
    }

    // 8
    {
        let mut st = drive.unit.lock();
        if !foreign && !st.status.contains(UnitStatus::LABELED) {
            st.space = st.capacity;
        }
        st.status.remove(UnitStatus::REQUESTED);
    }
    if job.flags.contains(MountFlags::MIGKIT) {
        debug!("eq {}: migration toolkit mount keeps {} open", eq, ce.vsn);
    } else {
        release_unit(drive);
    }
    info!("eq {}: mounted {} from slot {}", eq, drive.unit.lock().vsn, ce.slot);
    event.dispose(Errno::Ok);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RobotConfig, Timing};
    use crate::event::{completion_channel, InternalCommand};
    use crate::sim::{SimMedium, SimWorld};
    use crossbeam::channel::unbounded;

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

    fn preview_mount(lib: &Library, vsn: &str, write: bool) -> (Event, MountJob, crossbeam::channel::Receiver<crate::preview::PreviewNotice>) {
        let (tx, rx) = unbounded();
        let entry = lib.ctx.previews.add(vsn, Some(MediaType::Lto), write, tx);
        let seq = lib.ctx.previews.try_claim(&entry).unwrap();
        let ce = lib.ctx.catalog.get_by_media(MediaType::Lto, vsn).unwrap();
        let preview = Some((entry, seq));
        let event = Event::internal(InternalCommand::Mount {
            slot: ce.slot,
            partition: 0,
            preview: preview.clone(),
        });
        (event, MountJob::for_preview(ce.slot, 0, preview), rx)
    }

    #[test]
    fn test_preview_mount_notifies_ok() {
        let (lib, _) = setup(fast());
        let drive = lib.drives[0].clone();
        drive.unit.lock().status |= UnitStatus::REQUESTED;
        let (event, job, rx) = preview_mount(&lib, "VSN002", false);
        mount(&lib, &drive, event, job);

        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.errno, Errno::Ok);
        assert_eq!(notice.eq, Some(drive.unit.eq));
        let st = drive.unit.lock();
        assert_eq!(st.vsn, "VSN002");
        assert!(st.status.contains(UnitStatus::LABELED | UnitStatus::READY));
        assert!(!st.status.contains(UnitStatus::REQUESTED));
        assert_eq!(st.active, 0);
        assert_eq!(lib.ctx.previews.count(), 0);
    }

    #[test]
    fn test_stale_sequence_is_silent() {
        let (lib, _) = setup(fast());
        let drive = lib.drives[0].clone();
        let (event, job, rx) = preview_mount(&lib, "VSN001", false);
        let id = job.entry().unwrap().id;
        lib.ctx.previews.replace(id, "VSN003", Some(MediaType::Lto), true);

        let (tx, done) = completion_channel();
        mount(&lib, &drive, event.with_reply(tx), job);
        assert_eq!(done.try_recv().unwrap().errno, Errno::Ok);
        assert!(rx.try_recv().is_err());
        assert_eq!(lib.ctx.previews.count(), 1);
        assert_eq!(drive.unit.lock().active, 0);

        // 替换后的请求仍可被服务
        let entry = lib.ctx.previews.get(id).unwrap();
        assert!(!entry.snapshot().busy);
        let pending = lib.ctx.previews.pending();
        assert!(pending.iter().any(|e| e.id == id));
        assert!(lib.ctx.previews.try_claim(&entry).is_some());
    }

    #[test]
    fn test_write_to_protected_is_eacces() {
        let mut config = fast();
        config.inventory[1].write_protected = true;
        let (lib, _) = setup(config);
        let drive = lib.drives[0].clone();
        let (event, job, rx) = preview_mount(&lib, "VSN001", true);
        mount(&lib, &drive, event, job);
        assert_eq!(rx.try_recv().unwrap().errno, Errno::EACCES);
    }

    #[test]
    fn test_cancelled_preview_gets_ecanceled() {
        let (lib, _) = setup(fast());
        let drive = lib.drives[0].clone();
        let (event, job, rx) = preview_mount(&lib, "VSN003", false);
        lib.ctx.previews.cancel(job.entry().unwrap().id);
        mount(&lib, &drive, event, job);
        assert_eq!(rx.try_recv().unwrap().errno, Errno::ECANCELED);
    }

    #[test]
    fn test_unlabeled_is_enospc_and_bad() {
        let (lib, world) = setup(fast());
        let drive = lib.drives[0].clone();
        // 目录说有标签，介质却是空白
        let element = lib.slot_element(0);
        let barcode = world.medium_at(element).and_then(|m| m.barcode);
        let mut blank = SimMedium::tape("", MediaType::Lto, 1000);
        blank.barcode = barcode;
        world.set_element(element, Some(blank));

        let (event, job, rx) = preview_mount(&lib, "VSN000", false);
        mount(&lib, &drive, event, job);
        assert_eq!(rx.try_recv().unwrap().errno, Errno::ENOSPC);
        assert!(lib.ctx.catalog.get_by_loc(lib.eq, 0, 0).unwrap().has(CeStatus::BAD_MEDIA));
    }

    #[test]
    fn test_auto_label_from_barcode() {
        let mut config = fast();
        config.defaults.label_barcode = true;
        let (lib, world) = setup(config);
        let drive = lib.drives[0].clone();

        // 槽位 4 有条码但没有标签
        let (tx, rx) = unbounded();
        let entry = lib.ctx.previews.add("VSN004", Some(MediaType::Lto), true, tx);
        let seq = lib.ctx.previews.try_claim(&entry).unwrap();
        let preview = Some((entry, seq));
        let event = Event::internal(InternalCommand::Mount {
            slot: 4,
            partition: 0,
            preview: preview.clone(),
        });
        mount(&lib, &drive, event, MountJob::for_preview(4, 0, preview));

        assert_eq!(rx.try_recv().unwrap().errno, Errno::Ok);
        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 4, 0).unwrap();
        assert_eq!(ce.vsn, "VSN004");
        assert!(ce.has(CeStatus::LABELED));
        let records = world.tape_records(drive.element);
        assert!(records[0].starts_with(b"VOL1VSN004"));
    }

    #[test]
    fn test_mount_refused_when_off() {
        let (lib, _) = setup(fast());
        let drive = lib.drives[0].clone();
        drive.unit.lock().state = DeviceState::Off;
        let (event, job, rx) = preview_mount(&lib, "VSN001", false);
        let entry = job.entry().unwrap().clone();
        let (tx, done) = completion_channel();
        mount(&lib, &drive, event.with_reply(tx), job);
        assert_eq!(done.try_recv().unwrap().errno, Errno::Ok);
        assert!(rx.try_recv().is_err());
        assert!(!entry.snapshot().busy);
    }

    #[test]
    fn test_migkit_mount_stays_open() {
        let (lib, _) = setup(fast());
        let drive = lib.drives[0].clone();
        let req = MountRequest {
            eq: lib.eq,
            slot: Some(2),
            partition: 0,
            media: None,
            vsn: String::new(),
            flags: MountFlags::MIGKIT,
        };
        let event = Event::message(crate::event::Command::Mount(req.clone()));
        mount(&lib, &drive, event, MountJob::from_request(&req));
        let st = drive.unit.lock();
        assert_eq!(st.active, 1);
        assert_eq!(st.open_count, 1);
        assert_eq!(st.vsn, "VSN002");
    }
}
