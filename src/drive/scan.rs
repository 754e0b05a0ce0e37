//! Learn what is on a freshly loaded medium

use tracing::{debug, info, warn};

use crate::device::{DeviceClass, Unit, UnitStatus};
use crate::labels::tape::LABEL_LEN;
use crate::labels::{PrimaryVolumeDescriptor, TapeLabels};
use crate::scsi::{ScsiDevice, SenseClass};

/// What the first records of a tape turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
enum TapeContents {
    Labeled { vsn: String, block_size: u32, label_time: u32 },
    Blank,
    Foreign,
}

fn read_tape_labels(unit: &Unit, io: &dyn ScsiDevice) -> TapeContents {
    if let Err(e) = io.rewind() {
        warn!("eq {}: rewind before scan failed: {}", unit.eq, e);
        return TapeContents::Blank;
    }
    let vol1 = match io.read_record(LABEL_LEN) {
        Ok(rec) => rec,
        Err(e) if e.class() == SenseClass::BlankCheck => return TapeContents::Blank,
        Err(e) => {
            debug!("eq {}: cannot read first record: {}", unit.eq, e);
            return TapeContents::Blank;
        }
    };
    let Ok(vsn) = TapeLabels::parse_vol1(&vol1) else {
        return if vol1.is_empty() {
            TapeContents::Blank
        } else {
            TapeContents::Foreign
        };
    };

    let headers = io
        .read_record(LABEL_LEN)
        .and_then(|hdr1| io.read_record(LABEL_LEN).map(|hdr2| (hdr1, hdr2)));
    let (block_size, label_time) = match headers
        .ok()
        .and_then(|(hdr1, hdr2)| TapeLabels::parse(&vol1, &hdr1, &hdr2).ok())
    {
        Some(info) => (info.block_size, info.label_time),
        None => {
            debug!("eq {}: VOL1 {} without usable HDR1/HDR2", unit.eq, vsn);
            (0, 0)
        }
    };
    TapeContents::Labeled {
        vsn,
        block_size,
        label_time,
    }
}

fn scan_tape(unit: &Unit, io: &dyn ScsiDevice) {
    let contents = read_tape_labels(unit, io);
    if let Err(e) = io.rewind() {
        debug!("eq {}: rewind after scan failed: {}", unit.eq, e);
    }
    let mut st = unit.lock();
    match contents {
        TapeContents::Labeled {
            vsn,
            block_size,
            label_time,
        } => {
            st.status |= UnitStatus::LABELED;
            st.vsn = vsn;
            if block_size > 0 {
                st.block_size = block_size;
            }
            st.label_time = label_time;
        }
        TapeContents::Foreign => {
            st.status |= UnitStatus::STRANGE;
        }
        TapeContents::Blank => {}
    }
}

fn scan_optical(unit: &Unit, io: &dyn ScsiDevice) {
    let (address, sector_size) = {
        let st = unit.lock();
        (st.optical.label_address, st.optical.sector_size as usize)
    };
    let sector = match io.read_sectors(address, 1) {
        Ok(buf) => buf,
        Err(e) => {
            debug!("eq {}: cannot read label sector: {}", unit.eq, e);
            return;
        }
    };
    let label = &sector[..sector.len().min(sector_size.max(1))];
    match PrimaryVolumeDescriptor::from_bytes(label) {
        Ok(pvd) => {
            let mut st = unit.lock();
            st.status |= UnitStatus::LABELED;
            st.vsn = pvd.volume_id;
            debug!("eq {}: volume descriptor sequence {}", unit.eq, pvd.sequence);
        }
        Err(_) if label.iter().all(|&b| b == 0) => {}
        Err(e) => {
            debug!("eq {}: foreign optical label: {}", unit.eq, e);
            unit.lock().status |= UnitStatus::STRANGE;
        }
    }
}

/// Read the label of the loaded medium into the unit.
///
/// The device must be open. Leaves the unit `READY|PRESENT`, `LABELED` with
/// the VSN when a label was found, `STRANGE` for foreign data, and
/// `space == capacity`; callers reconcile space with the catalog.
pub fn scan_a_device(unit: &Unit, io: &dyn ScsiDevice) {
    {
        let mut st = unit.lock();
        st.status |= UnitStatus::SCANNING;
        st.status.remove(UnitStatus::LABELED | UnitStatus::STRANGE | UnitStatus::READY);
        st.set_message("scanning");
    }

    match io.media_info() {
        Ok(info) => {
            let mut st = unit.lock();
            st.status.set(UnitStatus::WRITE_PROTECT, info.write_protected);
            st.media_worm = info.worm;
        }
        Err(e) => debug!("eq {}: media info unavailable: {}", unit.eq, e),
    }

    match unit.class {
        DeviceClass::Tape => scan_tape(unit, io),
        DeviceClass::Optical => scan_optical(unit, io),
        DeviceClass::Robot => {}
    }

    let capacity = io.read_capacity().unwrap_or_else(|e| {
        warn!("eq {}: read capacity failed: {}", unit.eq, e);
        0
    });

    let mut st = unit.lock();
    st.capacity = capacity;
    st.space = capacity;
    if unit.class == DeviceClass::Optical {
        st.optical.total_sectors = u32::try_from(capacity).unwrap_or(u32::MAX);
    }
    st.status |= UnitStatus::READY | UnitStatus::PRESENT;
    st.status.remove(UnitStatus::SCANNING);
    if st.status.contains(UnitStatus::LABELED) {
        info!("eq {}: found volume {}", unit.eq, st.vsn);
        let msg = format!("{} ready", st.vsn);
        st.set_message(msg);
    } else if st.status.contains(UnitStatus::STRANGE) {
        st.set_message("foreign media");
    } else {
        st.set_message("unlabeled media");
    }
}
