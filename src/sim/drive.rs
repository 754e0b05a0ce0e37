use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{SimMedium, SimWorld, TapeBlock};
use crate::scsi::{
    asc, sense_keys, DeviceIdent, MediaInfo, ScsiDevice, ScsiError, ScsiResult, SenseData,
};

fn check(key: u8, code: u8, qualifier: u8) -> ScsiError {
    ScsiError::Check(SenseData::new(key, code, qualifier))
}

fn no_media() -> ScsiError {
    check(sense_keys::NOT_READY, asc::MEDIUM_NOT_PRESENT, 0)
}

fn write_protected() -> ScsiError {
    check(sense_keys::DATA_PROTECT, asc::WRITE_PROTECTED, 0)
}

/// Drive bound to one element of a [`SimWorld`]
pub struct SimDrive {
    world: Arc<SimWorld>,
    element: u32,
    name: String,
    open: AtomicBool,
}

impl SimDrive {
    pub(super) fn new(world: Arc<SimWorld>, element: u32, name: &str) -> Self {
        Self {
            world,
            element,
            name: name.to_string(),
            open: AtomicBool::new(false),
        }
    }

    pub fn element(&self) -> u32 {
        self.element
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn require_open(&self) -> ScsiResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ScsiError::NotOpen(self.name.clone()))
        }
    }

    fn medium<T>(&self, f: impl FnOnce(&mut SimMedium, &mut usize) -> ScsiResult<T>) -> ScsiResult<T> {
        self.world
            .with_medium(self.element, |medium, pos, _| f(medium, pos))
            .unwrap_or_else(|| Err(no_media()))
    }
}

impl ScsiDevice for SimDrive {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> ScsiResult<()> {
        {
            let mut faults = self.world.faults();
            if faults.open_failures > 0 {
                faults.open_failures -= 1;
                return Err(ScsiError::Transport(format!("{}: open refused", self.name)));
            }
        }
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn test_unit_ready(&self) -> ScsiResult<()> {
        let element = self.element;
        self.world
            .with_medium(element, |medium, _, faults| {
                if faults.tur_not_ready > 0 {
                    faults.tur_not_ready -= 1;
                    return Err(check(
                        sense_keys::NOT_READY,
                        asc::LOGICAL_UNIT_NOT_READY,
                        asc::ASCQ_BECOMING_READY,
                    ));
                }
                if medium.bad {
                    return Err(check(sense_keys::MEDIUM_ERROR, 0x11, 0));
                }
                if medium.cleaning {
                    if medium.cleaning_polls > 0 {
                        medium.cleaning_polls -= 1;
                        return Err(check(
                            sense_keys::NOT_READY,
                            asc::INCOMPATIBLE_MEDIUM,
                            asc::ASCQ_CLEANING_CARTRIDGE,
                        ));
                    }
                    return Ok(());
                }
                if faults.request_cleaning.remove(&element) {
                    return Err(check(sense_keys::NO_SENSE, 0, asc::ASCQ_CLEANING_REQUESTED));
                }
                Ok(())
            })
            .unwrap_or_else(|| Err(no_media()))
    }

    fn start_stop(&self, start: bool, eject: bool) -> ScsiResult<()> {
        debug!("{}: start/stop start={} eject={}", self.name, start, eject);
        Ok(())
    }

    fn inquiry(&self) -> ScsiResult<DeviceIdent> {
        Ok(DeviceIdent {
            vendor: "SAMSIM".to_string(),
            product: "VIRTUAL DRIVE".to_string(),
            revision: "0100".to_string(),
        })
    }

    fn reset(&self) -> ScsiResult<()> {
        self.world.count_reset(self.element);
        Ok(())
    }

    fn rewind(&self) -> ScsiResult<()> {
        self.medium(|_, pos| {
            *pos = 0;
            Ok(())
        })
    }

    fn erase(&self, long: bool) -> ScsiResult<()> {
        let failed = self.world.faults().erase_fails;
        if failed {
            return Err(check(sense_keys::MEDIUM_ERROR, 0x51, 0));
        }
        self.medium(|medium, pos| {
            if medium.write_protected {
                return Err(write_protected());
            }
            medium.records.truncate(*pos);
            Ok(())
        })?;
        self.world.count_erase(self.element, long);
        Ok(())
    }

    fn write_record(&self, data: &[u8]) -> ScsiResult<usize> {
        self.require_open()?;
        self.medium(|medium, pos| {
            if medium.write_protected {
                return Err(write_protected());
            }
            medium.records.truncate(*pos);
            medium.records.push(TapeBlock::Data(data.to_vec()));
            *pos += 1;
            Ok(data.len())
        })
    }

    fn read_record(&self, max_len: usize) -> ScsiResult<Vec<u8>> {
        self.require_open()?;
        self.medium(|medium, pos| match medium.records.get(*pos) {
            None => Err(check(sense_keys::BLANK_CHECK, 0, 0x05)),
            Some(TapeBlock::Filemark) => {
                *pos += 1;
                Ok(Vec::new())
            }
            Some(TapeBlock::Data(d)) => {
                *pos += 1;
                Ok(d[..d.len().min(max_len)].to_vec())
            }
        })
    }

    fn write_filemarks(&self, count: u32) -> ScsiResult<()> {
        self.require_open()?;
        self.medium(|medium, pos| {
            if medium.write_protected {
                return Err(write_protected());
            }
            medium.records.truncate(*pos);
            for _ in 0..count {
                medium.records.push(TapeBlock::Filemark);
            }
            *pos += count as usize;
            Ok(())
        })
    }

    fn locate(&self, block: u64) -> ScsiResult<()> {
        self.medium(|medium, pos| {
            *pos = (block as usize).min(medium.records.len());
            Ok(())
        })
    }

    fn space_to_eod(&self) -> ScsiResult<u64> {
        self.medium(|medium, pos| {
            *pos = medium.records.len();
            Ok(*pos as u64)
        })
    }

    fn read_capacity(&self) -> ScsiResult<u64> {
        self.medium(|medium, _| Ok(medium.capacity))
    }

    fn read_sectors(&self, lba: u32, count: u32) -> ScsiResult<Vec<u8>> {
        self.medium(|medium, _| {
            let mut out = Vec::with_capacity(count as usize * medium.sector_size);
            for n in lba..lba + count {
                match medium.sectors.get(&n) {
                    Some(sector) => out.extend_from_slice(sector),
                    None => out.resize(out.len() + medium.sector_size, 0),
                }
            }
            Ok(out)
        })
    }

    fn write_sectors(&self, lba: u32, data: &[u8]) -> ScsiResult<()> {
        self.medium(|medium, _| {
            if medium.write_protected {
                return Err(write_protected());
            }
            for (n, chunk) in data.chunks(medium.sector_size).enumerate() {
                let mut sector = chunk.to_vec();
                sector.resize(medium.sector_size, 0);
                medium.sectors.insert(lba + n as u32, sector);
            }
            Ok(())
        })
    }

    fn media_info(&self) -> ScsiResult<MediaInfo> {
        self.medium(|medium, _| {
            Ok(MediaInfo {
                write_protected: medium.write_protected,
                worm: medium.worm,
                cleaning: medium.cleaning,
            })
        })
    }

    fn set_tapealert(&self, enable: bool) -> ScsiResult<()> {
        debug!("{}: TapeAlert {}", self.name, if enable { "on" } else { "off" });
        Ok(())
    }

    fn set_sef(&self, enable: bool, interval: u32) -> ScsiResult<()> {
        debug!("{}: SEF enable={} interval={}", self.name, enable, interval);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MediaType;
    use crate::scsi::SenseClass;

    #[test]
    fn test_tape_records_and_blank_check() {
        let world = SimWorld::new();
        world.set_element(100, Some(SimMedium::tape("", MediaType::Lto, 100)));
        let drive = world.drive(100, "t0");
        assert!(matches!(drive.write_record(b"x"), Err(ScsiError::NotOpen(_))));
        drive.open().unwrap();

        drive.write_record(b"abc").unwrap();
        drive.write_filemarks(1).unwrap();
        drive.rewind().unwrap();
        assert_eq!(drive.read_record(80).unwrap(), b"abc");
        assert!(drive.read_record(80).unwrap().is_empty());
        let err = drive.read_record(80).unwrap_err();
        assert_eq!(err.class(), SenseClass::BlankCheck);
    }

    #[test]
    fn test_empty_drive_reports_no_media() {
        let world = SimWorld::new();
        let drive = world.drive(100, "t0");
        assert_eq!(drive.test_unit_ready().unwrap_err().class(), SenseClass::NoMedia);
    }

    #[test]
    fn test_cleaning_cartridge_polls() {
        let world = SimWorld::new();
        let mut cln = SimMedium::cleaning("CLN001");
        cln.cleaning_polls = 2;
        world.set_element(100, Some(cln));
        let drive = world.drive(100, "t0");
        for _ in 0..2 {
            assert_eq!(
                drive.test_unit_ready().unwrap_err().class(),
                SenseClass::CleaningInProgress
            );
        }
        drive.test_unit_ready().unwrap();
        assert!(drive.media_info().unwrap().cleaning);
    }

    #[test]
    fn test_requested_cleaning_fires_once() {
        let world = SimWorld::new();
        world.set_element(100, Some(SimMedium::tape("T00001", MediaType::Lto, 100)));
        world.faults().request_cleaning.insert(100);
        let drive = world.drive(100, "t0");
        assert_eq!(
            drive.test_unit_ready().unwrap_err().class(),
            SenseClass::CleaningRequested
        );
        drive.test_unit_ready().unwrap();
    }
}
