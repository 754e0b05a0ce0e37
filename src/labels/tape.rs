//! ANSI tape labels (VOL1 / HDR1 / HDR2)
//!
//! 三个 80 字节的标签记录，空格填充。HDR2 的块大小字段拆成 5 位主字段
//! 加 3 位扩展字段，以容纳超过 99999 的块大小。

use chrono::{DateTime, Datelike, TimeZone};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{LabelError, LabelFlags, LabelParams};
use crate::device::{Unit, UnitStatus};
use crate::scsi::{block_sizes::TAPE_SECTOR_SIZE, wait_for_device_ready, ScsiDevice, SenseClass};

pub const LABEL_LEN: usize = 80;
pub const IMPLEMENTATION_ID: &str = "SAM-FS 2.0";

const TUR_ATTEMPTS: u32 = 3;

// VOL1
const VOL1_VSN: std::ops::Range<usize> = 4..10;
const VOL1_IMPL_ID: std::ops::Range<usize> = 24..37;
const VOL1_STANDARD_VERSION: usize = 79;

// HDR1
const HDR1_FILE_ID: std::ops::Range<usize> = 4..21;
const HDR1_SECTION: std::ops::Range<usize> = 27..31;
const HDR1_SEQUENCE: std::ops::Range<usize> = 31..35;
const HDR1_GENERATION: std::ops::Range<usize> = 35..39;
const HDR1_GEN_VERSION: std::ops::Range<usize> = 39..41;
const HDR1_CREATION: std::ops::Range<usize> = 41..47;
const HDR1_SYSTEM_CODE: std::ops::Range<usize> = 60..73;

// HDR2
const HDR2_BLOCK_LENGTH: std::ops::Range<usize> = 5..10;
const HDR2_RECORD_LENGTH: std::ops::Range<usize> = 10..15;
const HDR2_LABEL_TIME: std::ops::Range<usize> = 15..19;
const HDR2_BLOCK_LENGTH_EXT: std::ops::Range<usize> = 52..55;

/// ANSI creation date: leading char, two-digit year, 1-based day of year
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnsiDate {
    /// '0' from year 2000 on, ' ' before
    pub leading: char,
    pub year: u8,
    pub day: u16,
}

impl AnsiDate {
    pub fn from_date<D: Datelike>(date: &D) -> Self {
        let year = date.year();
        Self {
            leading: if year >= 2000 { '0' } else { ' ' },
            year: year.rem_euclid(100) as u8,
            day: date.ordinal() as u16,
        }
    }

    pub fn format(&self) -> String {
        format!("{}{:02}{:03}", self.leading, self.year, self.day)
    }

    pub fn parse(field: &[u8]) -> Option<Self> {
        if field.len() != 6 || !field[1..].iter().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let text = std::str::from_utf8(&field[1..]).ok()?;
        Some(Self {
            leading: field[0] as char,
            year: text[..2].parse().ok()?,
            day: text[2..].parse().ok()?,
        })
    }
}

impl std::fmt::Display for AnsiDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// Decoded content of a label triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TapeLabelInfo {
    pub vsn: String,
    pub implementation_id: String,
    pub file_identifier: String,
    pub creation_date: Option<AnsiDate>,
    pub block_size: u32,
    pub record_length: u32,
    /// 0 when the label carries no time
    pub label_time: u32,
}

/// The three label records in write order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeLabels {
    pub vol1: [u8; LABEL_LEN],
    pub hdr1: [u8; LABEL_LEN],
    pub hdr2: [u8; LABEL_LEN],
}

fn put(record: &mut [u8; LABEL_LEN], range: std::ops::Range<usize>, text: &str) {
    let len = range.len();
    let field = &mut record[range];
    let bytes = text.as_bytes();
    let n = bytes.len().min(len);
    field[..n].copy_from_slice(&bytes[..n]);
}

fn text_of(record: &[u8], range: std::ops::Range<usize>) -> String {
    String::from_utf8_lossy(&record[range]).trim_end().to_string()
}

/// Block size as `%8d`, split into (ext = chars 0..3, length = chars 3..8)
pub fn format_block_length(block_size: u32) -> ([u8; 3], [u8; 5]) {
    let text = format!("{:8}", block_size);
    let bytes = text.as_bytes();
    let mut ext = [b' '; 3];
    let mut len = [b' '; 5];
    // 超过 8 位的值不会出现，已被 clamp 到 max_blocksize
    if bytes.len() == 8 {
        ext.copy_from_slice(&bytes[0..3]);
        len.copy_from_slice(&bytes[3..8]);
    }
    (ext, len)
}

pub fn parse_block_length(ext: &[u8], len: &[u8]) -> Option<u32> {
    let mut digits = String::with_capacity(8);
    digits.push_str(&String::from_utf8_lossy(ext));
    digits.push_str(&String::from_utf8_lossy(len));
    digits.trim().parse().ok()
}

/// Default a zero request from the drive, then clamp into
/// `[TAPE_SECTOR_SIZE, max_blocksize]`.
pub fn clamp_block_size(requested: u32, default_blocksize: u32, max_blocksize: u32) -> u32 {
    let size = if requested == 0 && default_blocksize != 0 {
        default_blocksize
    } else {
        requested
    };
    size.clamp(TAPE_SECTOR_SIZE, max_blocksize.max(TAPE_SECTOR_SIZE))
}

impl TapeLabels {
    /// Build the records for `params`. `block_size` must already be clamped.
    pub fn build<Tz: TimeZone>(params: &LabelParams, block_size: u32, now: &DateTime<Tz>) -> Self {
        let mut vol1 = [b' '; LABEL_LEN];
        let mut hdr1 = [b' '; LABEL_LEN];
        let mut hdr2 = [b' '; LABEL_LEN];

        vol1[0..4].copy_from_slice(b"VOL1");
        put(&mut vol1, VOL1_VSN, &params.vsn);
        vol1[VOL1_STANDARD_VERSION] = b'4';
        put(&mut vol1, VOL1_IMPL_ID, IMPLEMENTATION_ID);

        hdr1[0..4].copy_from_slice(b"HDR1");
        put(&mut hdr1, HDR1_SYSTEM_CODE, IMPLEMENTATION_ID);
        let file_id = params.info.as_deref().unwrap_or(&params.vsn);
        put(&mut hdr1, HDR1_FILE_ID, file_id);
        put(&mut hdr1, HDR1_SECTION, "0001");
        put(&mut hdr1, HDR1_SEQUENCE, "0001");
        put(&mut hdr1, HDR1_GENERATION, "0001");
        put(&mut hdr1, HDR1_GEN_VERSION, "00");
        put(&mut hdr1, HDR1_CREATION, &AnsiDate::from_date(now).format());

        hdr2[0..4].copy_from_slice(b"HDR2");
        let (ext, len) = format_block_length(block_size);
        hdr2[HDR2_BLOCK_LENGTH].copy_from_slice(&len);
        hdr2[HDR2_BLOCK_LENGTH_EXT].copy_from_slice(&ext);
        put(&mut hdr2, HDR2_RECORD_LENGTH, &format!("{:5}", 1));
        let label_time = u32::try_from(now.timestamp()).unwrap_or(0);
        hdr2[HDR2_LABEL_TIME].copy_from_slice(&label_time.to_be_bytes());

        Self { vol1, hdr1, hdr2 }
    }

    pub fn records(&self) -> [&[u8; LABEL_LEN]; 3] {
        [&self.vol1, &self.hdr1, &self.hdr2]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LABEL_LEN * 3);
        for record in self.records() {
            out.extend_from_slice(record);
        }
        out
    }

    /// Split a 240-byte image back into its records
    pub fn from_bytes(image: &[u8]) -> Result<Self, LabelError> {
        if image.len() < LABEL_LEN * 3 {
            return Err(LabelError::Malformed(format!(
                "label image is {} bytes, need {}",
                image.len(),
                LABEL_LEN * 3
            )));
        }
        let mut labels = Self {
            vol1: [0; LABEL_LEN],
            hdr1: [0; LABEL_LEN],
            hdr2: [0; LABEL_LEN],
        };
        labels.vol1.copy_from_slice(&image[0..80]);
        labels.hdr1.copy_from_slice(&image[80..160]);
        labels.hdr2.copy_from_slice(&image[160..240]);
        Ok(labels)
    }

    /// Decode VOL1 alone; enough to learn the VSN
    pub fn parse_vol1(vol1: &[u8]) -> Result<String, LabelError> {
        if vol1.len() != LABEL_LEN || &vol1[0..4] != b"VOL1" {
            return Err(LabelError::Malformed("no VOL1 record".into()));
        }
        Ok(text_of(vol1, VOL1_VSN))
    }

    pub fn parse(vol1: &[u8], hdr1: &[u8], hdr2: &[u8]) -> Result<TapeLabelInfo, LabelError> {
        let vsn = Self::parse_vol1(vol1)?;
        if hdr1.len() != LABEL_LEN || &hdr1[0..4] != b"HDR1" {
            return Err(LabelError::Malformed("no HDR1 record".into()));
        }
        if hdr2.len() != LABEL_LEN || &hdr2[0..4] != b"HDR2" {
            return Err(LabelError::Malformed("no HDR2 record".into()));
        }

        let block_size =
            parse_block_length(&hdr2[HDR2_BLOCK_LENGTH_EXT], &hdr2[HDR2_BLOCK_LENGTH])
                .ok_or_else(|| LabelError::Malformed("bad HDR2 block length".into()))?;
        let record_length = text_of(hdr2, HDR2_RECORD_LENGTH)
            .trim()
            .parse()
            .unwrap_or(0);
        let time_bytes = &hdr2[HDR2_LABEL_TIME];
        let label_time = if time_bytes.iter().all(|&b| b == b' ') {
            0
        } else {
            u32::from_be_bytes([time_bytes[0], time_bytes[1], time_bytes[2], time_bytes[3]])
        };

        Ok(TapeLabelInfo {
            vsn,
            implementation_id: text_of(vol1, VOL1_IMPL_ID),
            file_identifier: text_of(hdr1, HDR1_FILE_ID),
            creation_date: AnsiDate::parse(&hdr1[HDR1_CREATION]),
            block_size,
            record_length,
            label_time,
        })
    }

    pub fn info(&self) -> Result<TapeLabelInfo, LabelError> {
        Self::parse(&self.vol1, &self.hdr1, &self.hdr2)
    }
}

/// Recover from a failed erase: bus reset, then rewind to clear the
/// unit attention the reset raises.
fn erase_recovery(io: &dyn ScsiDevice, unit: &Unit, cause: String) -> LabelError {
    unit.lock().status.remove(UnitStatus::LABELLING);
    error!("eq {}: erase failed: {}", unit.eq, cause);
    if let Err(e) = io.reset() {
        warn!("eq {}: reset after erase failure failed: {}", unit.eq, e);
    } else if let Err(e) = io.rewind() {
        warn!("eq {}: rewind after reset failed: {}", unit.eq, e);
    }
    unit.set_message("write label: erase failed");
    LabelError::Erase(cause)
}

/// Write VOL1/HDR1/HDR2 and an end-of-data mark to the loaded tape.
///
/// Caller holds `unit.io_mutex` and has the device open. The unit lock is
/// only taken for short status updates. On success the unit is left
/// `PRESENT` (plus `CLEANING` if it was set) with `space == capacity`; the
/// caller rescans to pick up the new label.
pub fn write_tape_labels(
    io: &dyn ScsiDevice,
    unit: &Unit,
    params: &LabelParams,
    ready_delay: Duration,
) -> Result<(), LabelError> {
    let (old_vsn, props) = {
        let mut st = unit.lock();
        let old = if st.status.contains(UnitStatus::LABELED) {
            st.status.remove(UnitStatus::LABELED);
            st.vsn.clone()
        } else {
            String::new()
        };
        st.vsn.clear();
        (old, st.tape.clone())
    };

    let block_size = clamp_block_size(
        params.block_size,
        props.default_blocksize,
        props.max_blocksize,
    );
    let labels = TapeLabels::build(params, block_size, &chrono::Local::now());
    debug!(
        "eq {}: labels built for {} (old {:?}), block size {}",
        unit.eq, params.vsn, old_vsn, block_size
    );

    if let Err(first) = io.rewind() {
        debug!("eq {}: rewind failed ({}), retrying", unit.eq, first);
        if let Err(e) = io.rewind() {
            error!(
                "eq {}: cannot rewind to label {} (was {:?}): {}",
                unit.eq, params.vsn, old_vsn, e
            );
            return Err(LabelError::Rewind(e.to_string()));
        }
    }

    let erase = if params.flags.contains(LabelFlags::ERASE) {
        Some(true)
    } else if unit.model.format_on_first_label() && old_vsn.is_empty() {
        Some(false)
    } else {
        None
    };

    if let Some(long) = erase {
        {
            let mut st = unit.lock();
            st.status |= UnitStatus::LABELLING;
            st.set_message(if long {
                "write label: erase started"
            } else {
                "write label: format started"
            });
        }
        info!(
            "eq {}: {} erase before labeling {}",
            unit.eq,
            if long { "long" } else { "short" },
            params.vsn
        );
        if let Err(e) = io.erase(long) {
            return Err(erase_recovery(io, unit, e.to_string()));
        }
        unit.set_message("write label - rewinding");
        if let Err(e) = io.rewind() {
            error!("eq {}: rewind after erase failed: {}", unit.eq, e);
            unit.lock().status.remove(UnitStatus::LABELLING);
            return Err(LabelError::Rewind(e.to_string()));
        }
    }

    if let Err(e) = wait_for_device_ready(io, TUR_ATTEMPTS, ready_delay) {
        error!(
            "eq {}: drive not ready for labels ({:?} -> {}): {}",
            unit.eq, old_vsn, params.vsn, e
        );
        unit.lock().status.remove(UnitStatus::LABELLING);
        return Err(LabelError::NotReady(e.to_string()));
    }

    {
        let mut st = unit.lock();
        st.status |= UnitStatus::LABELLING;
        st.status.remove(UnitStatus::STOR_FULL);
    }

    // close/open 清除某些驱动器在空白带上读后写的介质错误状态
    io.close();
    if let Err(e) = io.open() {
        let mut st = unit.lock();
        st.status.remove(UnitStatus::LABELLING);
        st.set_message("unable to reopen for labels");
        error!("eq {}: unable to reopen {}: {}", unit.eq, unit.name, e);
        return Err(LabelError::Reopen(e.to_string()));
    }

    unit.set_message("writing labels");
    let mut written = 0usize;
    let mut failure_class = None;
    for (record, name) in labels.records().iter().zip(["vol1", "hdr1", "hdr2"]) {
        unit.set_message(format!("writing labels: {}", name));
        match io.write_record(&record[..]) {
            Ok(n) if n == LABEL_LEN => written += 1,
            Ok(n) => {
                warn!("eq {}: short label write {} of {} bytes", unit.eq, n, LABEL_LEN);
                break;
            }
            Err(e) => {
                failure_class = Some(e.class());
                warn!("eq {}: label write failed: {}", unit.eq, e);
                break;
            }
        }
    }

    if written != 3 {
        error!("eq {}: only {} label records written", unit.eq, written);
        let mut st = unit.lock();
        st.status.remove(UnitStatus::LABELLING);
        if failure_class == Some(SenseClass::WriteProtected) && props.volsafe {
            warn!("eq {}: attempt to relabel VOLSAFE media", unit.eq);
            st.tape.volsafe_perm_label = true;
            st.set_message("VOLSAFE media cannot be relabeled");
            return Err(LabelError::Volsafe);
        }
        st.space = 0;
        st.capacity = 0;
        st.set_message("label write failed");
        return Err(LabelError::Write { written });
    }

    unit.lock().vsn = params.vsn.clone();
    if let Err(e) = io.write_filemarks(1) {
        error!(
            "eq {}: cannot write end of data after labels ({:?} -> {}): {}",
            unit.eq, old_vsn, params.vsn, e
        );
        let mut st = unit.lock();
        st.vsn.clear();
        st.space = 0;
        st.capacity = 0;
        st.status.remove(UnitStatus::LABELLING);
        return Err(LabelError::Eod(e.to_string()));
    }
    unit.lock().vsn.clear();

    if let Err(e) = io.rewind() {
        warn!("eq {}: rewind after labeling failed: {}", unit.eq, e);
    }

    // 介质密度可能在写入时切换，容量必须在此刻读取
    let capacity = io.read_capacity().unwrap_or_else(|e| {
        warn!("eq {}: read capacity failed: {}", unit.eq, e);
        0
    });

    let mut st = unit.lock();
    st.space = capacity;
    st.capacity = capacity;
    st.block_size = block_size;
    st.status = (st.status & UnitStatus::CLEANING) | UnitStatus::PRESENT;
    info!("eq {}: labeled {} (block size {})", unit.eq, params.vsn, block_size);
    Ok(())
}
