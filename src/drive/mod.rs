//! Drive controller
//!
//! One thread per drive pops events off the drive queue and runs them to
//! completion. The submodules hold the individual protocols; this module
//! owns the loop, the dispatch table and the shared drive bookkeeping.

use chrono::Utc;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::VolumeInfo;
use crate::device::{DeviceState, Unit, UnitState, UnitStatus};
use crate::error::Errno;
use crate::event::{CleanRequest, Command, Event, EventKind, InternalCommand};
use crate::library::Library;
use crate::scsi::ScsiDevice;

pub mod audit;
pub mod clean;
pub mod label;
pub mod media;
pub mod mount;
pub mod scan;
pub mod state;
pub mod todo;

pub use media::{GetMediaError, SpinError};

/// What the robot knows about the drive slot itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveStatus {
    pub full: bool,
    /// Contents were learned from a move or a query, not guessed
    pub valid: bool,
    /// Loaded upside down (side B of two-sided media)
    pub invert: bool,
    /// Storage element the medium came from
    pub media_element: Option<u32>,
    pub slot: Option<u32>,
    pub partition: u8,
    pub bar_code: Option<String>,
}

#[derive(Default)]
struct DriveQueue {
    events: VecDeque<Event>,
    shutdown: bool,
}

pub struct Drive {
    pub unit: Arc<Unit>,
    /// Element address of the drive in the library
    pub element: u32,
    pub io: Arc<dyn ScsiDevice>,
    status: Mutex<DriveStatus>,
    queue: Mutex<DriveQueue>,
    queue_cv: Condvar,
    cln_inprog: AtomicBool,
}

impl Drive {
    pub fn new(unit: Arc<Unit>, element: u32, io: Arc<dyn ScsiDevice>) -> Self {
        Self {
            unit,
            element,
            io,
            status: Mutex::new(DriveStatus::default()),
            queue: Mutex::new(DriveQueue::default()),
            queue_cv: Condvar::new(),
            cln_inprog: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, DriveStatus> {
        self.status.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, DriveStatus>> {
        self.status.try_lock()
    }

    pub fn enqueue(&self, event: Event) {
        let mut q = self.queue.lock();
        if q.shutdown {
            drop(q);
            debug!("eq {}: {} after shutdown", self.unit.eq, event.describe());
            event.dispose(Errno::ECANCELED);
            return;
        }
        q.events.push_back(event);
        self.queue_cv.notify_one();
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.lock().events.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().events.len()
    }

    /// Take every queued event except those `keep` selects
    pub fn drain_queue_except(&self, keep: impl Fn(&Event) -> bool) -> Vec<Event> {
        let mut q = self.queue.lock();
        let (kept, taken): (VecDeque<Event>, VecDeque<Event>) =
            q.events.drain(..).partition(|ev| keep(ev));
        q.events = kept;
        taken.into()
    }

    pub fn stop(&self) {
        let mut q = self.queue.lock();
        q.shutdown = true;
        self.queue_cv.notify_all();
    }

    pub fn cleaning_in_progress(&self) -> bool {
        self.cln_inprog.load(Ordering::Acquire)
    }

    pub fn set_cleaning_in_progress(&self, on: bool) {
        self.cln_inprog.store(on, Ordering::Release);
    }
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drive")
            .field("eq", &self.unit.eq)
            .field("element", &self.element)
            .finish()
    }
}

pub(crate) fn is_state_change(event: &Event) -> bool {
    matches!(&event.kind, EventKind::Message(msg) if matches!(msg.command, Command::State(_)))
}

/// Administratively down the drive and wake anyone waiting on it
pub(crate) fn down_drive(drive: &Drive, reason: &str) {
    let mut st = drive.unit.lock();
    st.down(drive.unit.eq, reason);
    drop(st);
    drive.unit.notify();
}

pub(crate) fn clear_requested(drive: &Drive) {
    drive.unit.lock().status.remove(UnitStatus::REQUESTED);
}

/// Drop one open reference; the device is closed with the last one
pub(crate) fn close_unit(drive: &Drive) {
    let mut st = drive.unit.lock();
    if st.open_count == 0 {
        return;
    }
    st.dec_open(drive.unit.eq);
    if st.open_count == 0 {
        drive.io.close();
    }
}

/// Close and drop the active reference taken for an operation
pub(crate) fn release_unit(drive: &Drive) {
    close_unit(drive);
    let mut st = drive.unit.lock();
    st.mtime = Utc::now().timestamp();
    drive.unit.release(&mut st);
}

/// Snapshot of the loaded volume for `Catalog::update`
pub(crate) fn volume_info(lib: &Library, st: &UnitState) -> Option<VolumeInfo> {
    let slot = st.slot?;
    Some(VolumeInfo {
        eq: lib.eq,
        slot,
        partition: st.partition,
        media: st.media,
        vsn: st.vsn.clone(),
        labeled: st.status.contains(UnitStatus::LABELED),
        read_only: st.status.contains(UnitStatus::READ_ONLY),
        write_protect: st.status.contains(UnitStatus::WRITE_PROTECT),
        bad_media: st.status.contains(UnitStatus::BAD_MEDIA),
        space: st.space,
        capacity: st.capacity,
        label_time: st.label_time,
        position: st.position,
    })
}

enum Flow {
    Continue,
    Exit,
}

/// Drive thread
pub(crate) fn run(lib: Arc<Library>, drive: Arc<Drive>) {
    let eq = drive.unit.eq;
    let poll = lib.ctx.timing().idle_poll();
    let mut timed_out = false;
    info!("eq {}: drive thread started", eq);

    loop {
        if !timed_out && drive.queue_is_empty() {
            state::idle_to_off(&lib, &drive);
            if !lib.ctx.previews.pending().is_empty() {
                lib.request_check();
            }
        }
        schedule_autoclean(&lib, &drive);

        let next = {
            let mut q = drive.queue.lock();
            if q.shutdown {
                break;
            }
            if q.events.is_empty() {
                timed_out = drive.queue_cv.wait_for(&mut q, poll).timed_out();
                if q.shutdown {
                    break;
                }
            }
            q.events.pop_front()
        };

        let Some(event) = next else {
            if timed_out {
                idle_unload(&lib, &drive);
            }
            continue;
        };
        timed_out = false;

        debug!("eq {}: dispatching {}", eq, event.describe());
        if let Flow::Exit = dispatch(&lib, &drive, event) {
            break;
        }
        if drive.unit.state() >= DeviceState::Off && !drive.queue_is_empty() {
            lib.move_list(&drive);
        }
    }

    for event in drive.drain_queue_except(|_| false) {
        if let EventKind::Internal(InternalCommand::Mount {
            preview: Some((entry, _)),
            ..
        }) = &event.kind
        {
            lib.ctx.previews.clear_busy(entry);
        }
        event.dispose(Errno::ECANCELED);
    }
    info!("eq {}: drive thread stopped", eq);
}

/// Queue a clean for a drive that asked for one
fn schedule_autoclean(lib: &Library, drive: &Drive) {
    if !lib.ctx.defaults().autoclean || drive.cleaning_in_progress() {
        return;
    }
    let wanted = {
        let st = drive.unit.lock();
        st.status.contains(UnitStatus::CLEANING) && st.state < DeviceState::Off
    };
    if !wanted {
        return;
    }
    info!("eq {}: drive needs cleaning, scheduling clean", drive.unit.eq);
    drive.set_cleaning_in_progress(true);
    lib.submit(
        Event::message(Command::Clean(CleanRequest { eq: drive.unit.eq }))
            .delay(lib.ctx.timing().delayed_requeue()),
    );
}

/// Unload a drive nobody has used for a while. Gives up on any contention.
pub(crate) fn idle_unload(lib: &Library, drive: &Drive) {
    let Some(mut d) = drive.try_lock() else {
        return;
    };
    if !d.full {
        drive.unit.set_message("empty");
        return;
    }
    let threshold = {
        let Some(mut st) = drive.unit.try_lock() else {
            return;
        };
        if st.state >= DeviceState::Idle
            || st.open_count > 0
            || st.active > 0
            || st.status.intersects(
                UnitStatus::REQUESTED | UnitStatus::AUDIT | UnitStatus::CLEANING,
            )
        {
            return;
        }
        let defaults = lib.ctx.defaults();
        let threshold = if drive.unit.shared {
            defaults.shared_unload
        } else {
            defaults.idle_unload
        };
        let idle_for = Utc::now().timestamp() - st.mtime;
        if threshold == 0 || idle_for < threshold as i64 {
            st.set_message("idle");
            return;
        }
        st.inc_active();
        threshold
    };

    info!(
        "eq {}: idle for {}s or more, unloading",
        drive.unit.eq, threshold
    );
    if let Err(e) = media::clear_drive_locked(lib, drive, &mut d) {
        warn!("eq {}: idle unload failed: {}", drive.unit.eq, e);
    }
    drop(d);
    let mut st = drive.unit.lock();
    drive.unit.release(&mut st);
    drop(st);
    if !lib.ctx.previews.pending().is_empty() {
        lib.request_check();
    }
}

fn dispatch(lib: &Arc<Library>, drive: &Arc<Drive>, event: Event) -> Flow {
    match event.kind.clone() {
        EventKind::Internal(cmd) => match cmd {
            InternalCommand::StartAudit { eod } => audit::start_audit(lib, drive, event, eod),
            InternalCommand::AuditSlot { slot, eod } => {
                audit::audit_request(lib, drive, event, slot, eod)
            }
            InternalCommand::Init => {
                media::init_drive(lib, drive);
                event.dispose(Errno::Ok);
            }
            InternalCommand::Mount {
                slot,
                partition,
                preview,
            } => mount::mount(
                lib,
                drive,
                event,
                mount::MountJob::for_preview(slot, partition, preview),
            ),
            InternalCommand::Shutdown => {
                event.dispose(Errno::Ok);
                return Flow::Exit;
            }
            InternalCommand::Query => {
                media::query(lib, drive);
                event.dispose(Errno::Ok);
            }
        },
        EventKind::Message(msg) => {
            if !msg.is_valid() {
                warn!("eq {}: bad message magic {:#x}", drive.unit.eq, msg.magic);
                event.dispose(Errno::EINVAL);
                return Flow::Continue;
            }
            match msg.command {
                Command::Mount(req) => {
                    mount::mount(lib, drive, event, mount::MountJob::from_request(&req))
                }
                Command::Label(req) => label::label_slot(lib, drive, event, &req),
                Command::Unload(_) => media::unload(lib, drive, event),
                Command::Clean(_) => {
                    if drive.unit.lock().active > 0 {
                        debug!("eq {}: busy, clean requeued", drive.unit.eq);
                        lib.submit(event.delay(lib.ctx.timing().delayed_requeue()));
                    } else {
                        clean::clean(lib, drive, event);
                    }
                }
                Command::Audit(req) => match req.slot {
                    Some(slot) => audit::audit_request(lib, drive, event, slot, req.eod),
                    None => lib.start_audit(Some(event), req.eod),
                },
                Command::State(req) => state::drive_state_change(lib, drive, event, &req),
                Command::LoadUnavail(req) => state::load_unavail(lib, drive, event, &req),
                Command::Todo(req) => todo::todo(lib, drive, event, &req),
                Command::TapeAlert(req) => state::tapealert(drive, event, &req),
                Command::Sef(req) => state::sef(drive, event, &req),
                Command::Shutdown => {
                    event.dispose(Errno::Ok);
                    return Flow::Exit;
                }
            }
        }
    }
    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RobotConfig;
    use crate::event::{completion_channel, ToggleRequest};
    use crate::sim::SimWorld;

    fn idle_library() -> (Arc<Library>, Arc<SimWorld>) {
        let mut config = RobotConfig::default();
        config.timing = crate::config::Timing::fast();
        let world = SimWorld::from_config(&config);
        let (lib, _) = Library::with_world(config, &world).unwrap();
        (lib, world)
    }

    #[test]
    fn test_drain_keeps_state_changes() {
        let (lib, _) = idle_library();
        let drive = &lib.drives[0];
        drive.enqueue(Event::internal(InternalCommand::Query));
        drive.enqueue(Event::message(Command::State(crate::event::StateChange {
            eq: drive.unit.eq,
            old_state: DeviceState::On,
            new_state: DeviceState::Off,
        })));
        let taken = drive.drain_queue_except(is_state_change);
        assert_eq!(taken.len(), 1);
        assert_eq!(drive.queue_len(), 1);
        for ev in taken {
            ev.dispose(Errno::Ok);
        }
        for ev in drive.drain_queue_except(|_| false) {
            ev.dispose(Errno::Ok);
        }
    }

    #[test]
    fn test_enqueue_after_stop_cancels() {
        let (lib, _) = idle_library();
        let drive = &lib.drives[0];
        drive.stop();
        let (tx, rx) = completion_channel();
        drive.enqueue(Event::internal(InternalCommand::Query).with_reply(tx));
        assert_eq!(rx.try_recv().unwrap().errno, Errno::ECANCELED);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let (lib, _) = idle_library();
        let drive = lib.drives[0].clone();
        let (tx, rx) = completion_channel();
        let mut ev = Event::message(Command::TapeAlert(ToggleRequest {
            eq: drive.unit.eq,
            enable: true,
        }))
        .with_reply(tx);
        if let EventKind::Message(msg) = &mut ev.kind {
            msg.magic = 0;
        }
        dispatch(&lib, &drive, ev);
        assert_eq!(rx.try_recv().unwrap().errno, Errno::EINVAL);
        assert!(!drive.unit.lock().tapealert);
    }

    #[test]
    fn test_idle_unload_after_threshold() {
        let (lib, world) = idle_library();
        let drive = lib.drives[0].clone();
        let ce = lib.ctx.catalog.get_by_loc(lib.eq, 2, 0).unwrap();
        {
            let mut d = drive.lock();
            media::get_media(&lib, &drive, &mut d, &ce).unwrap();
        }
        release_unit(&drive);
        assert!(world.is_full(drive.element));

        // 最近使用过，不卸载
        idle_unload(&lib, &drive);
        assert!(world.is_full(drive.element));

        drive.unit.lock().mtime = Utc::now().timestamp() - 10_000;
        idle_unload(&lib, &drive);
        assert!(!world.is_full(drive.element));
        assert!(world.is_full(lib.slot_element(2)));
        assert_eq!(drive.unit.lock().active, 0);
    }
}
