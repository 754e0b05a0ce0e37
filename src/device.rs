//! Device units and the device registry
//!
//! A [`Unit`] is one physical drive or robot controller. Its mutable fields
//! live in [`UnitState`] behind the unit lock; label and byte I/O is
//! serialised separately by `io_mutex` so status readers are not blocked by
//! a write in flight.

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::catalog::MediaType;
use crate::error::{Result, RobotError};
use crate::scsi::{block_sizes, DeviceIdent};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct UnitStatus: u32 {
        const READY = 1 << 0;
        const PRESENT = 1 << 1;
        const LABELED = 1 << 2;
        const LABELLING = 1 << 3;
        const SCANNING = 1 << 4;
        const REQUESTED = 1 << 5;
        const CLEANING = 1 << 6;
        const BAD_MEDIA = 1 << 7;
        const READ_ONLY = 1 << 8;
        const WRITE_PROTECT = 1 << 9;
        const STOR_FULL = 1 << 10;
        const AUDIT = 1 << 11;
        /// Foreign (non-SAM) medium
        const STRANGE = 1 << 12;
        const UNLOAD = 1 << 13;
        const WAIT_IDLE = 1 << 14;
        const OPENED = 1 << 15;
        const FS_ACTIVE = 1 << 16;
    }
}

/// Administrative device state. Ordering matters: anything above `Idle`
/// cannot accept new mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    On,
    Ro,
    Idle,
    Unavail,
    Off,
    Down,
}

impl DeviceState {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "on" => Some(DeviceState::On),
            "ro" => Some(DeviceState::Ro),
            "idle" => Some(DeviceState::Idle),
            "unavail" => Some(DeviceState::Unavail),
            "off" => Some(DeviceState::Off),
            "down" => Some(DeviceState::Down),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DeviceState::On => "on",
            DeviceState::Ro => "ro",
            DeviceState::Idle => "idle",
            DeviceState::Unavail => "unavail",
            DeviceState::Off => "off",
            DeviceState::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Tape,
    Optical,
    Robot,
}

/// Drive models with behaviour of their own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveModel {
    #[default]
    Generic,
    /// Cleaning completion is detected by polling TUR
    Ibm3570,
    /// Virgin media get a short erase (format) before the first label
    SonyDtf,
}

impl DriveModel {
    pub fn format_on_first_label(&self) -> bool {
        matches!(self, DriveModel::SonyDtf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeProperties {
    pub default_blocksize: u32,
    pub max_blocksize: u32,
    pub volsafe: bool,
    /// Set once a VOLSAFE cartridge refused a relabel
    pub volsafe_perm_label: bool,
}

impl Default for TapeProperties {
    fn default() -> Self {
        Self {
            default_blocksize: block_sizes::DEFAULT_BLOCK_SIZE,
            max_blocksize: block_sizes::MAX_BLOCK_SIZE,
            volsafe: false,
            volsafe_perm_label: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpticalProperties {
    pub label_address: u32,
    pub sector_size: u32,
    pub total_sectors: u32,
}

impl Default for OpticalProperties {
    fn default() -> Self {
        Self {
            label_address: 0,
            sector_size: block_sizes::OPTICAL_SECTOR_SIZE,
            total_sectors: 0,
        }
    }
}

/// Fields guarded by the unit lock
#[derive(Debug, Clone)]
pub struct UnitState {
    pub status: UnitStatus,
    pub state: DeviceState,
    pub vsn: String,
    pub media: Option<MediaType>,
    pub slot: Option<u32>,
    pub partition: u8,
    /// Partition of the other side for two-sided media
    pub flip_partition: Option<u8>,
    /// Free space, units of 1024 bytes
    pub space: u64,
    pub capacity: u64,
    pub open_count: u32,
    pub active: u32,
    /// Operator status message
    pub dis_mes: String,
    pub label_time: u32,
    /// Last use of the loaded medium, unix seconds
    pub mtime: i64,
    pub delay: i64,
    pub block_size: u32,
    pub position: u64,
    pub media_worm: bool,
    pub tapealert: bool,
    pub sef_interval: Option<u32>,
    pub ident: Option<DeviceIdent>,
    pub tape: TapeProperties,
    pub optical: OpticalProperties,
}

impl Default for UnitState {
    fn default() -> Self {
        Self {
            status: UnitStatus::empty(),
            state: DeviceState::On,
            vsn: String::new(),
            media: None,
            slot: None,
            partition: 0,
            flip_partition: None,
            space: 0,
            capacity: 0,
            open_count: 0,
            active: 0,
            dis_mes: String::new(),
            label_time: 0,
            mtime: 0,
            delay: 30,
            block_size: 0,
            position: 0,
            media_worm: false,
            tapealert: false,
            sef_interval: None,
            ident: None,
            tape: TapeProperties::default(),
            optical: OpticalProperties::default(),
        }
    }
}

impl UnitState {
    pub fn inc_active(&mut self) {
        self.active += 1;
    }

    /// Decrement the active count. The count never goes negative; an
    /// unbalanced release is logged.
    pub fn dec_active(&mut self, eq: u16) {
        if self.active == 0 {
            warn!("eq {}: active count already zero on release", eq);
            return;
        }
        self.active -= 1;
    }

    pub fn inc_open(&mut self) {
        self.open_count += 1;
        self.status |= UnitStatus::OPENED;
    }

    pub fn dec_open(&mut self, eq: u16) {
        if self.open_count == 0 {
            warn!("eq {}: open count already zero on close", eq);
        } else {
            self.open_count -= 1;
        }
        if self.open_count == 0 {
            self.status.remove(UnitStatus::OPENED);
        }
    }

    /// Forget everything learned about the loaded medium
    pub fn clear_fields(&mut self) {
        self.vsn.clear();
        self.media = None;
        self.space = 0;
        self.capacity = 0;
        self.label_time = 0;
        self.block_size = 0;
        self.position = 0;
        self.media_worm = false;
        self.status.remove(
            UnitStatus::READY
                | UnitStatus::LABELED
                | UnitStatus::READ_ONLY
                | UnitStatus::WRITE_PROTECT
                | UnitStatus::STOR_FULL
                | UnitStatus::BAD_MEDIA
                | UnitStatus::STRANGE
                | UnitStatus::SCANNING,
        );
    }

    pub fn set_message<T: Into<String>>(&mut self, msg: T) {
        self.dis_mes = msg.into();
    }

    /// Administratively down the device
    pub fn down(&mut self, eq: u16, reason: &str) {
        error!("eq {}: device downed: {}", eq, reason);
        self.state = DeviceState::Down;
        self.status.remove(UnitStatus::REQUESTED);
        self.dis_mes = format!("device down: {}", reason);
    }
}

/// One physical drive or robot
pub struct Unit {
    pub eq: u16,
    pub name: String,
    pub class: DeviceClass,
    pub model: DriveModel,
    pub shared: bool,
    inner: Mutex<UnitState>,
    /// Serialises label writes and positioning
    pub io_mutex: Mutex<()>,
    changed: Condvar,
}

impl Unit {
    pub fn new(eq: u16, name: &str, class: DeviceClass) -> Self {
        Self {
            eq,
            name: name.to_string(),
            class,
            model: DriveModel::Generic,
            shared: false,
            inner: Mutex::new(UnitState::default()),
            io_mutex: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    pub fn with_model(mut self, model: DriveModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_state(self, init: impl FnOnce(&mut UnitState)) -> Self {
        init(&mut self.inner.lock());
        self
    }

    pub fn lock(&self) -> MutexGuard<'_, UnitState> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, UnitState>> {
        self.inner.try_lock()
    }

    pub fn snapshot(&self) -> UnitState {
        self.inner.lock().clone()
    }

    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    pub fn status(&self) -> UnitStatus {
        self.inner.lock().status
    }

    pub fn is_tape(&self) -> bool {
        self.class == DeviceClass::Tape
    }

    pub fn set_message<T: Into<String>>(&self, msg: T) {
        self.inner.lock().dis_mes = msg.into();
    }

    /// Decrement the active count and wake anyone in `wait_for_idle`
    pub fn release(&self, state: &mut UnitState) {
        state.dec_active(self.eq);
        self.changed.notify_all();
    }

    /// Wake waiters after a state change made through `lock()`
    pub fn notify(&self) {
        self.changed.notify_all();
    }

    /// Block until the active count drops to zero. Returns false on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        while state.active > 0 {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.active == 0;
            }
        }
        true
    }
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("eq", &self.eq)
            .field("name", &self.name)
            .field("class", &self.class)
            .finish()
    }
}

/// Arena of units indexed by equipment id
#[derive(Default)]
pub struct DeviceRegistry {
    units: Vec<Arc<Unit>>,
    index: HashMap<u16, usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, unit: Arc<Unit>) -> Result<usize> {
        if self.index.contains_key(&unit.eq) {
            return Err(RobotError::config(format!(
                "duplicate equipment id {}",
                unit.eq
            )));
        }
        let idx = self.units.len();
        self.index.insert(unit.eq, idx);
        self.units.push(unit);
        Ok(idx)
    }

    pub fn get(&self, eq: u16) -> Option<&Arc<Unit>> {
        self.index.get(&eq).map(|&idx| &self.units[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Unit>> {
        self.units.iter()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_state_ordering() {
        assert!(DeviceState::On < DeviceState::Idle);
        assert!(DeviceState::Idle < DeviceState::Unavail);
        assert!(DeviceState::Off < DeviceState::Down);
        assert_eq!(DeviceState::from_name("UNAVAIL"), Some(DeviceState::Unavail));
        assert_eq!(DeviceState::from_name("bogus"), None);
    }

    #[test]
    fn test_active_count_never_negative() {
        let unit = Unit::new(10, "/dev/rmt/0", DeviceClass::Tape);
        let mut st = unit.lock();
        st.inc_active();
        unit.release(&mut st);
        unit.release(&mut st);
        assert_eq!(st.active, 0);
    }

    #[test]
    fn test_open_count_tracks_opened_bit() {
        let unit = Unit::new(10, "/dev/rmt/0", DeviceClass::Tape);
        let mut st = unit.lock();
        st.inc_open();
        assert!(st.status.contains(UnitStatus::OPENED));
        st.dec_open(10);
        assert!(!st.status.contains(UnitStatus::OPENED));
    }

    #[test]
    fn test_wait_for_idle_wakes_on_release() {
        let unit = Arc::new(Unit::new(11, "/dev/rmt/1", DeviceClass::Tape));
        unit.lock().inc_active();

        let worker = {
            let unit = unit.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let mut st = unit.lock();
                unit.release(&mut st);
            })
        };

        assert!(unit.wait_for_idle(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut reg = DeviceRegistry::new();
        reg.insert(Arc::new(Unit::new(1, "a", DeviceClass::Robot))).unwrap();
        assert!(reg
            .insert(Arc::new(Unit::new(1, "b", DeviceClass::Tape)))
            .is_err());
        assert_eq!(reg.get(1).unwrap().name, "a");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_clear_fields_keeps_cleaning() {
        let unit = Unit::new(12, "d", DeviceClass::Tape);
        let mut st = unit.lock();
        st.vsn = "VSN001".into();
        st.status = UnitStatus::READY | UnitStatus::LABELED | UnitStatus::CLEANING;
        st.clear_fields();
        assert!(st.vsn.is_empty());
        assert_eq!(st.status, UnitStatus::CLEANING);
    }
}
