//! SCSI hardware primitives
//!
//! The orchestration core never builds drive CDBs itself; it drives the
//! hardware through [`ScsiDevice`], a set of blocking primitives with
//! sense-data error reporting.

use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod constants;
pub mod sense;

pub use constants::*;
pub use sense::{SenseClass, SenseData};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScsiError {
    #[error("check condition: {0}")]
    Check(SenseData),

    #[error("device {0} is not open")]
    NotOpen(String),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite {
        written: usize,
        expected: usize,
        sense: Option<SenseData>,
    },

    #[error("transport failure: {0}")]
    Transport(String),
}

impl ScsiError {
    pub fn sense(&self) -> Option<SenseData> {
        match self {
            ScsiError::Check(sense) => Some(*sense),
            ScsiError::ShortWrite { sense, .. } => *sense,
            _ => None,
        }
    }

    pub fn class(&self) -> SenseClass {
        self.sense()
            .map(|s| s.classify())
            .unwrap_or(SenseClass::Fatal)
    }
}

pub type ScsiResult<T> = std::result::Result<T, ScsiError>;

/// INQUIRY identification strings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdent {
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

/// Properties of the medium currently loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaInfo {
    pub write_protected: bool,
    pub worm: bool,
    pub cleaning: bool,
}

/// Blocking drive primitives. Tape operations are record oriented, optical
/// operations are sector oriented; a device only needs to honour the ones
/// matching its class.
pub trait ScsiDevice: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self) -> ScsiResult<()>;
    fn close(&self);
    fn test_unit_ready(&self) -> ScsiResult<()>;
    fn start_stop(&self, start: bool, eject: bool) -> ScsiResult<()>;
    fn inquiry(&self) -> ScsiResult<DeviceIdent>;
    /// Bus/device reset
    fn reset(&self) -> ScsiResult<()>;
    fn rewind(&self) -> ScsiResult<()>;
    fn erase(&self, long: bool) -> ScsiResult<()>;
    fn write_record(&self, data: &[u8]) -> ScsiResult<usize>;
    fn read_record(&self, max_len: usize) -> ScsiResult<Vec<u8>>;
    fn write_filemarks(&self, count: u32) -> ScsiResult<()>;
    fn locate(&self, block: u64) -> ScsiResult<()>;
    /// Position at end of data, returning the block position reached
    fn space_to_eod(&self) -> ScsiResult<u64>;
    /// Native capacity in units of 1024 bytes
    fn read_capacity(&self) -> ScsiResult<u64>;
    fn read_sectors(&self, lba: u32, count: u32) -> ScsiResult<Vec<u8>>;
    fn write_sectors(&self, lba: u32, data: &[u8]) -> ScsiResult<()>;
    fn media_info(&self) -> ScsiResult<MediaInfo>;
    fn set_tapealert(&self, enable: bool) -> ScsiResult<()>;
    fn set_sef(&self, enable: bool, interval: u32) -> ScsiResult<()>;
}

/// Poll TEST UNIT READY until the device is ready.
///
/// Retryable conditions (not ready, becoming ready, unit attention) sleep
/// `delay` and try again, at most `retries` attempts in total. A drive
/// asking for cleaning still counts as ready; the caller sees that through
/// the returned class.
pub fn wait_for_device_ready(
    device: &dyn ScsiDevice,
    retries: u32,
    delay: Duration,
) -> ScsiResult<SenseClass> {
    let retries = retries.max(1);

    for attempt in 1..=retries {
        match device.test_unit_ready() {
            Ok(()) => {
                debug!("{}: TestUnitReady ok (attempt {})", device.name(), attempt);
                return Ok(SenseClass::Ready);
            }
            Err(err) => {
                let class = err.class();
                match class {
                    SenseClass::Ready => return Ok(SenseClass::Ready),
                    SenseClass::CleaningRequested => {
                        info!("{}: drive requests cleaning", device.name());
                        return Ok(SenseClass::CleaningRequested);
                    }
                    c if c.is_retryable() && attempt < retries => {
                        debug!(
                            "{}: device {} ({}), retrying in {:?} (attempts remaining: {})",
                            device.name(),
                            c.description(),
                            err,
                            delay,
                            retries - attempt
                        );
                        thread::sleep(delay);
                    }
                    _ => {
                        warn!("{}: TestUnitReady failed: {}", device.name(), err);
                        return Err(err);
                    }
                }
            }
        }
    }

    Err(ScsiError::Transport(format!(
        "{}: device not ready after {} attempts",
        device.name(),
        retries
    )))
}
