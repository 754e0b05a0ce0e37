//! Library coordinator
//!
//! One thread per library owns the inbound work queue. It resolves mount,
//! label and clean requests to a drive, forwards drive-targeted commands,
//! serves pending previews through `check_requests` and drives the
//! library-wide audit.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, CeStatus, MemoryCatalog};
use crate::config::RobotConfig;
use crate::context::RobotContext;
use crate::device::{DeviceClass, DeviceRegistry, DeviceState, TapeProperties, Unit, UnitStatus};
use crate::drive::{self, Drive};
use crate::error::{Errno, Result, RobotError};
use crate::event::{Event, EventKind, InternalCommand};
use crate::preview::{PreviewEntry, PreviewNotice};
use crate::scsi::ScsiDevice;
use crate::sim::SimWorld;
use crate::transport::{open_transport, MediaTransport};

pub mod requests;

/// Partition number of side B on two-sided media
pub const SIDE_B: u8 = 1;

#[derive(Default)]
struct LibraryQueue {
    events: VecDeque<Event>,
    /// A drive asked for `check_requests`
    chk_req: bool,
    shutdown: bool,
}

/// Library-wide audit counters
#[derive(Debug, Default)]
pub struct AuditProgress {
    /// Drives that have not yet joined the audit
    pub countdown: usize,
    /// Next slot to hand out
    pub audit_index: u32,
    pub drives_auditing: usize,
    pending: Option<Event>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LibraryFlags {
    pub mounted: bool,
    pub audit: bool,
    pub ready: bool,
}

pub struct Library {
    pub eq: u16,
    pub unit: Arc<Unit>,
    pub drives: Vec<Arc<Drive>>,
    pub ctx: Arc<RobotContext>,
    pub transport: Arc<dyn MediaTransport>,
    pub two_sided: bool,
    pub storage_count: u32,
    pub transport_element: u32,
    slot_base: u32,
    queue: Mutex<LibraryQueue>,
    queue_cv: Condvar,
    audit: Mutex<AuditProgress>,
    audit_cv: Condvar,
    flags: Mutex<LibraryFlags>,
}

impl Library {
    /// Build units, registry, context and drives. `devices` pairs up with
    /// `config.library.drives` by position.
    pub fn build(
        config: RobotConfig,
        catalog: Arc<dyn Catalog>,
        transport: Arc<dyn MediaTransport>,
        devices: Vec<Arc<dyn ScsiDevice>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let lib_cfg = config.library.clone();
        if devices.len() != lib_cfg.drives.len() {
            return Err(RobotError::config(format!(
                "library {}: {} drives configured but {} devices given",
                lib_cfg.eq,
                lib_cfg.drives.len(),
                devices.len()
            )));
        }

        let mut registry = DeviceRegistry::new();
        let robot = Arc::new(
            Unit::new(lib_cfg.eq, &lib_cfg.name, DeviceClass::Robot).with_state(|st| {
                st.status = UnitStatus::READY | UnitStatus::PRESENT;
            }),
        );
        registry.insert(robot.clone())?;

        let mut units = Vec::with_capacity(lib_cfg.drives.len());
        for dc in &lib_cfg.drives {
            let unit = Arc::new(
                Unit::new(dc.eq, &dc.name, dc.class)
                    .with_model(dc.model)
                    .with_shared(dc.shared)
                    .with_state(|st| {
                        st.state = dc.state;
                        st.status = UnitStatus::PRESENT;
                        st.tape = TapeProperties {
                            default_blocksize: dc.default_blocksize,
                            max_blocksize: dc.max_blocksize,
                            volsafe: dc.volsafe,
                            volsafe_perm_label: false,
                        };
                    }),
            );
            registry.insert(unit.clone())?;
            units.push(unit);
        }

        let ctx = Arc::new(RobotContext::new(config, registry, catalog));
        let drives = units
            .into_iter()
            .zip(lib_cfg.drives.iter())
            .zip(devices)
            .map(|((unit, dc), io)| Arc::new(Drive::new(unit, dc.element, io)))
            .collect();

        Ok(Arc::new(Self {
            eq: lib_cfg.eq,
            unit: robot,
            drives,
            ctx,
            transport,
            two_sided: lib_cfg.two_sided,
            storage_count: lib_cfg.storage_count,
            transport_element: lib_cfg.transport_element,
            slot_base: lib_cfg.slot_base,
            queue: Mutex::new(LibraryQueue::default()),
            queue_cv: Condvar::new(),
            audit: Mutex::new(AuditProgress::default()),
            audit_cv: Condvar::new(),
            flags: Mutex::new(LibraryFlags::default()),
        }))
    }

    /// Library over a simulated world, with a catalog filled from the
    /// configured inventory
    pub fn with_world(
        config: RobotConfig,
        world: &Arc<SimWorld>,
    ) -> Result<(Arc<Self>, Arc<MemoryCatalog>)> {
        let catalog = Arc::new(MemoryCatalog::new());
        SimWorld::populate_catalog(&config, &catalog);
        let transport = open_transport(&config.library, Some(world.clone()))?;
        let devices = config
            .library
            .drives
            .iter()
            .map(|d| Arc::new(world.drive(d.element, &d.name)) as Arc<dyn ScsiDevice>)
            .collect();
        let library = Self::build(config, catalog.clone(), transport, devices)?;
        Ok((library, catalog))
    }

    /// Spawn the drive threads and the coordinator thread
    pub fn start(self: &Arc<Self>) -> Result<LibraryHandle> {
        let mut threads = Vec::with_capacity(self.drives.len() + 1);
        for drive in &self.drives {
            let (lib, d) = (self.clone(), drive.clone());
            threads.push(
                thread::Builder::new()
                    .name(format!("drive-{}", drive.unit.eq))
                    .spawn(move || drive::run(lib, d))?,
            );
            drive.enqueue(Event::internal(InternalCommand::Init));
        }
        let lib = self.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("library-{}", self.eq))
                .spawn(move || run(lib))?,
        );
        info!(
            "library {}: started with {} drives, {} slots",
            self.eq,
            self.drives.len(),
            self.storage_count
        );
        Ok(LibraryHandle {
            library: self.clone(),
            threads,
        })
    }

    pub fn submit(&self, event: Event) {
        let mut q = self.queue.lock();
        q.events.push_back(event);
        self.queue_cv.notify_one();
    }

    /// Ask the coordinator to run `check_requests`
    pub fn request_check(&self) {
        let mut q = self.queue.lock();
        q.chk_req = true;
        self.queue_cv.notify_one();
    }

    /// Register a mount request from a filesystem waiter
    pub fn add_preview(
        &self,
        vsn: &str,
        media: Option<crate::catalog::MediaType>,
        write: bool,
        notify: crossbeam::channel::Sender<PreviewNotice>,
    ) -> Arc<PreviewEntry> {
        let entry = self.ctx.previews.add(vsn, media, write, notify);
        self.request_check();
        entry
    }

    pub fn shutdown(&self) {
        {
            let mut q = self.queue.lock();
            q.shutdown = true;
            self.queue_cv.notify_all();
        }
        for drive in &self.drives {
            drive.stop();
        }
        // 唤醒等待审计汇合的驱动器
        self.audit_cv.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.lock().shutdown
    }

    pub fn flags(&self) -> LibraryFlags {
        *self.flags.lock()
    }

    pub fn slot_element(&self, slot: u32) -> u32 {
        self.slot_base + slot
    }

    pub fn element_slot(&self, element: u32) -> Option<u32> {
        element
            .checked_sub(self.slot_base)
            .filter(|slot| *slot < self.storage_count)
    }

    pub fn drive_by_eq(&self, eq: u16) -> Option<&Arc<Drive>> {
        self.drives.iter().find(|d| d.unit.eq == eq)
    }

    /// The drive currently holding `slot` with `partition` up, if any
    pub fn drive_holding(&self, slot: u32, partition: u8) -> Option<Arc<Drive>> {
        let element = self.slot_element(slot);
        self.drives
            .iter()
            .find(|drive| {
                let d = drive.lock();
                d.full
                    && d.media_element == Some(element)
                    && (!self.two_sided || d.partition == partition)
            })
            .cloned()
    }

    /// Pick a drive for new work and mark it `REQUESTED`. Empty drives are
    /// preferred over drives that would need an exchange.
    pub fn find_idle_drive(&self) -> Option<Arc<Drive>> {
        let mut loaded = None;
        for drive in &self.drives {
            if !drive.queue_is_empty() {
                continue;
            }
            let full = drive.lock().full;
            let mut st = drive.unit.lock();
            if st.state != DeviceState::On
                || st.active > 0
                || st.status.intersects(
                    UnitStatus::REQUESTED | UnitStatus::CLEANING | UnitStatus::AUDIT,
                )
            {
                continue;
            }
            if !full {
                st.status |= UnitStatus::REQUESTED;
                return Some(drive.clone());
            }
            if loaded.is_none() {
                loaded = Some(drive.clone());
            }
        }
        loaded.map(|drive| {
            drive.unit.lock().status |= UnitStatus::REQUESTED;
            drive
        })
    }

    /// Some drive could take work later
    pub fn has_usable_drive(&self) -> bool {
        self.drives
            .iter()
            .any(|d| d.unit.state() <= DeviceState::Idle)
    }

    /// Set or clear `OCCUPIED` on a slot, both sides on two-sided media
    pub fn set_occupied(&self, slot: u32, on: bool) {
        let catalog = &self.ctx.catalog;
        let sides: &[u8] = if self.two_sided { &[0, SIDE_B] } else { &[0] };
        for &part in sides {
            if catalog.get_by_loc(self.eq, slot, part).is_none() {
                continue;
            }
            if let Err(e) = catalog.set_status(self.eq, slot, part, CeStatus::OCCUPIED, on) {
                warn!("library {}: slot {}:{} occupied update failed: {}", self.eq, slot, part, e);
            }
        }
    }

    /// Return the drive's queued work to the library. Messages are
    /// redistributed; internal events are disposed with `EIO`. State
    /// changes stay with the drive.
    pub fn move_list(&self, drive: &Drive) {
        let events = drive.drain_queue_except(|ev| drive::is_state_change(ev));
        if events.is_empty() {
            return;
        }
        info!(
            "library {}: moving {} events off eq {}",
            self.eq,
            events.len(),
            drive.unit.eq
        );
        for event in events {
            if event.is_message() {
                self.submit(event);
                continue;
            }
            match &event.kind {
                EventKind::Internal(InternalCommand::StartAudit { .. }) => self.abandon_audit(),
                EventKind::Internal(InternalCommand::Mount {
                    preview: Some((entry, _)),
                    ..
                }) => self.ctx.previews.clear_busy(entry),
                _ => {}
            }
            event.dispose(Errno::EIO);
        }
        self.request_check();
    }

    /// Start a library-wide audit on every usable drive. `event` is
    /// disposed when the last drive finishes.
    pub fn start_audit(&self, event: Option<Event>, eod: bool) {
        let drives: Vec<_> = self
            .drives
            .iter()
            .filter(|d| d.unit.state() <= DeviceState::Idle)
            .cloned()
            .collect();
        {
            // 检查与置位在同一把锁下完成
            let mut f = self.flags.lock();
            if f.audit {
                drop(f);
                warn!("library {}: audit already running", self.eq);
                if let Some(ev) = event {
                    ev.dispose(Errno::EAGAIN);
                }
                return;
            }
            if drives.is_empty() {
                drop(f);
                error!("library {}: no drive available for audit", self.eq);
                self.unit.set_message("audit: no drives available");
                if let Some(ev) = event {
                    ev.dispose(Errno::EAGAIN);
                }
                return;
            }
            f.audit = true;
            f.ready = false;
            *self.audit.lock() = AuditProgress {
                countdown: drives.len(),
                audit_index: 0,
                drives_auditing: 0,
                pending: event,
            };
        }
        info!(
            "library {}: audit of {} slots on {} drives",
            self.eq,
            self.storage_count,
            drives.len()
        );
        self.unit.set_message("audit in progress");
        for drive in drives {
            drive.unit.lock().status |= UnitStatus::AUDIT;
            drive.enqueue(Event::internal(InternalCommand::StartAudit { eod }));
        }
    }

    /// Rendezvous: return once every audit drive has checked in
    pub(crate) fn join_audit(&self) {
        let mut p = self.audit.lock();
        p.countdown = p.countdown.saturating_sub(1);
        p.drives_auditing += 1;
        self.audit_cv.notify_all();
        while p.countdown > 0 {
            if self.is_shutting_down() {
                return;
            }
            self.audit_cv
                .wait_for(&mut p, self.ctx.timing().idle_poll());
        }
    }

    /// Hand out the next slot to audit, each slot exactly once
    pub(crate) fn claim_audit_slot(&self) -> Option<u32> {
        let mut p = self.audit.lock();
        if p.audit_index >= self.storage_count {
            return None;
        }
        let slot = p.audit_index;
        p.audit_index += 1;
        Some(slot)
    }

    pub(crate) fn leave_audit(&self) {
        let mut p = self.audit.lock();
        p.drives_auditing = p.drives_auditing.saturating_sub(1);
        self.finish_audit_if_done(p);
    }

    /// A drive that will never join (downed with the start event queued)
    fn abandon_audit(&self) {
        let mut p = self.audit.lock();
        p.countdown = p.countdown.saturating_sub(1);
        self.audit_cv.notify_all();
        self.finish_audit_if_done(p);
    }

    fn finish_audit_if_done(&self, mut p: MutexGuard<'_, AuditProgress>) {
        if p.drives_auditing > 0 || p.countdown > 0 {
            return;
        }
        let pending = p.pending.take();
        drop(p);

        {
            let mut f = self.flags.lock();
            if !f.audit {
                return;
            }
            f.mounted = true;
            f.audit = false;
            f.ready = true;
        }
        info!("library {}: audit complete", self.eq);
        self.unit.set_message("ready");
        if let Some(ev) = pending {
            ev.dispose(Errno::Ok);
        }
        self.request_check();
    }

    pub fn audit_progress(&self) -> (usize, u32, usize) {
        let p = self.audit.lock();
        (p.countdown, p.audit_index, p.drives_auditing)
    }
}

/// Running threads of a started library
pub struct LibraryHandle {
    pub library: Arc<Library>,
    threads: Vec<JoinHandle<()>>,
}

impl LibraryHandle {
    pub fn shutdown(self) {
        self.library.shutdown();
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                error!("thread {} panicked", name);
            }
        }
    }
}

enum Step {
    Check,
    Dispatch(Event),
    Idle,
}

/// Coordinator thread
pub(crate) fn run(lib: Arc<Library>) {
    let poll = lib.ctx.timing().idle_poll();
    loop {
        let step = {
            let mut q = lib.queue.lock();
            if q.shutdown {
                break;
            }
            let now = Instant::now();
            if std::mem::take(&mut q.chk_req) | lib.ctx.previews.take_recheck() {
                Step::Check
            } else if let Some(event) = q
                .events
                .iter()
                .position(|e| e.is_due(now))
                .and_then(|pos| q.events.remove(pos))
            {
                Step::Dispatch(event)
            } else {
                let wait = q
                    .events
                    .iter()
                    .filter_map(|e| e.timeout)
                    .min()
                    .map(|t| t.saturating_duration_since(now))
                    .unwrap_or(poll)
                    .min(poll);
                lib.queue_cv.wait_for(&mut q, wait);
                Step::Idle
            }
        };

        match step {
            Step::Check => requests::check_requests(&lib),
            Step::Dispatch(event) => requests::dispatch(&lib, event),
            Step::Idle => {}
        }
    }

    let leftover: Vec<Event> = lib.queue.lock().events.drain(..).collect();
    for event in leftover {
        debug!("library {}: cancelling {} at shutdown", lib.eq, event.describe());
        event.dispose(Errno::ECANCELED);
    }
    info!("library {}: coordinator stopped", lib.eq);
}
