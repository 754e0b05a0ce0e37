//! Optical volume labels
//!
//! Two little-endian descriptors at the unit's label address: a primary
//! volume descriptor followed by a partition descriptor, one sector each.
//! Both start with a 16-byte descriptor tag whose checksum covers the tag
//! bytes other than the checksum and reserved bytes.

use chrono::{DateTime, Datelike, Offset, TimeZone, Timelike};
use serde::Serialize;
use tracing::{debug, error, info};

use super::{LabelError, LabelParams};
use crate::device::{Unit, UnitStatus};
use crate::scsi::ScsiDevice;

pub const PRIMARY_VOL_DES: u16 = 1;
pub const PARTITION_DES: u16 = 5;

/// OSTA CS4 character set type
pub const CSET_4: u8 = 4;

pub const TAG_LEN: usize = 16;
pub const DESCRIPTOR_LEN: usize = 512;

const PARTITION_CONTENTS: &str = "*LSC01";
const PARTITION_START: u32 = 257;
const PARTITION_RESERVED: u32 = 514;
const ACCESS_WORM: u32 = 2;

fn le16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn put_str(buf: &mut [u8], text: &str) {
    let n = text.len().min(buf.len());
    buf[..n].copy_from_slice(&text.as_bytes()[..n]);
}

fn get_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}

/// Sum of tag bytes 0..16 except the checksum (4) and reserved (5) bytes
pub fn tag_checksum(tag: &[u8]) -> u8 {
    tag.iter()
        .take(TAG_LEN)
        .enumerate()
        .filter(|(i, _)| *i != 4 && *i != 5)
        .fold(0u8, |sum, (_, &b)| sum.wrapping_add(b))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DescriptorTag {
    pub identifier: u16,
    pub version: u16,
    pub checksum: u8,
    pub serial: u16,
    pub crc: u16,
    pub crc_length: u16,
    pub location: u32,
}

impl DescriptorTag {
    pub fn new(identifier: u16) -> Self {
        Self {
            identifier,
            version: 1,
            ..Default::default()
        }
    }

    /// Encode with a freshly computed checksum
    pub fn to_bytes(&self) -> [u8; TAG_LEN] {
        let mut buf = [0u8; TAG_LEN];
        buf[0..2].copy_from_slice(&self.identifier.to_le_bytes());
        buf[2..4].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.serial.to_le_bytes());
        buf[8..10].copy_from_slice(&self.crc.to_le_bytes());
        buf[10..12].copy_from_slice(&self.crc_length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.location.to_le_bytes());
        buf[4] = tag_checksum(&buf);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < TAG_LEN {
            return None;
        }
        Some(Self {
            identifier: le16(buf, 0),
            version: le16(buf, 2),
            checksum: buf[4],
            serial: le16(buf, 6),
            crc: le16(buf, 8),
            crc_length: le16(buf, 10),
            location: le32(buf, 12),
        })
    }
}

/// Recording timestamp; `timezone` is minutes west of UTC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpticalTimestamp {
    pub timezone: i16,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl OpticalTimestamp {
    pub fn from_datetime<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        let east = now.offset().fix().local_minus_utc();
        Self {
            timezone: (-east / 60) as i16,
            year: now.year() as u16,
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.timezone.to_le_bytes());
        buf[2..4].copy_from_slice(&self.year.to_le_bytes());
        buf[4] = self.month;
        buf[5] = self.day;
        buf[6] = self.hour;
        buf[7] = self.minute;
        buf[8] = self.second;
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            timezone: i16::from_le_bytes([buf[0], buf[1]]),
            year: le16(buf, 2),
            month: buf[4],
            day: buf[5],
            hour: buf[6],
            minute: buf[7],
            second: buf[8],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrimaryVolumeDescriptor {
    pub tag: DescriptorTag,
    pub sequence: u32,
    pub volume_id: String,
    pub interchange_level: u16,
    pub max_interchange_level: u16,
    pub character_set_list: u32,
    pub max_character_set_list: u32,
    pub descriptor_char_set: u8,
    pub explanatory_char_set: u8,
    pub recorded: OpticalTimestamp,
    pub implementation_use: String,
}

impl PrimaryVolumeDescriptor {
    pub fn new<Tz: TimeZone>(vsn: &str, info: Option<&str>, now: &DateTime<Tz>) -> Self {
        Self {
            tag: DescriptorTag::new(PRIMARY_VOL_DES),
            sequence: 1,
            volume_id: vsn.chars().take(31).collect(),
            interchange_level: 3,
            max_interchange_level: 3,
            character_set_list: 0xff,
            max_character_set_list: 0xff,
            descriptor_char_set: CSET_4,
            explanatory_char_set: CSET_4,
            recorded: OpticalTimestamp::from_datetime(now),
            implementation_use: info.map(|s| s.chars().take(64).collect()).unwrap_or_default(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DESCRIPTOR_LEN];
        buf[0..16].copy_from_slice(&self.tag.to_bytes());
        buf[16..20].copy_from_slice(&self.sequence.to_le_bytes());
        // 卷标 32 字节，最后一字节存长度
        put_str(&mut buf[20..51], &self.volume_id);
        buf[51] = self.volume_id.len().min(31) as u8;
        buf[52..54].copy_from_slice(&self.interchange_level.to_le_bytes());
        buf[54..56].copy_from_slice(&self.max_interchange_level.to_le_bytes());
        buf[56..60].copy_from_slice(&self.character_set_list.to_le_bytes());
        buf[60..64].copy_from_slice(&self.max_character_set_list.to_le_bytes());
        buf[64] = self.descriptor_char_set;
        buf[128] = self.explanatory_char_set;
        self.recorded.encode(&mut buf[192..204]);
        put_str(&mut buf[204..268], &self.implementation_use);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, LabelError> {
        vfyansi_label(buf, PRIMARY_VOL_DES)?;
        if buf.len() < DESCRIPTOR_LEN {
            return Err(LabelError::Malformed("short volume descriptor".into()));
        }
        let id_len = (buf[51] as usize).min(31);
        let tag = DescriptorTag::from_bytes(buf)
            .ok_or_else(|| LabelError::Malformed("short descriptor tag".into()))?;
        Ok(Self {
            tag,
            sequence: le32(buf, 16),
            volume_id: String::from_utf8_lossy(&buf[20..20 + id_len]).to_string(),
            interchange_level: le16(buf, 52),
            max_interchange_level: le16(buf, 54),
            character_set_list: le32(buf, 56),
            max_character_set_list: le32(buf, 60),
            descriptor_char_set: buf[64],
            explanatory_char_set: buf[128],
            recorded: OpticalTimestamp::decode(&buf[192..204]),
            implementation_use: get_str(&buf[204..268]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionDescriptor {
    pub tag: DescriptorTag,
    pub sequence: u32,
    pub flags: u16,
    pub contents: String,
    pub access_type: u32,
    pub starting_location: u32,
    pub length: u32,
    pub implementation_use: String,
}

impl PartitionDescriptor {
    pub fn new(total_sectors: u32, info: Option<&str>) -> Self {
        Self {
            tag: DescriptorTag::new(PARTITION_DES),
            sequence: 1,
            flags: 1,
            contents: PARTITION_CONTENTS.to_string(),
            access_type: ACCESS_WORM,
            starting_location: PARTITION_START,
            length: total_sectors.saturating_sub(PARTITION_RESERVED),
            implementation_use: info.map(|s| s.chars().take(128).collect()).unwrap_or_default(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; DESCRIPTOR_LEN];
        buf[0..16].copy_from_slice(&self.tag.to_bytes());
        buf[16..20].copy_from_slice(&self.sequence.to_le_bytes());
        buf[20..22].copy_from_slice(&self.flags.to_le_bytes());
        put_str(&mut buf[25..48], &self.contents);
        buf[56..60].copy_from_slice(&self.access_type.to_le_bytes());
        buf[60..64].copy_from_slice(&self.starting_location.to_le_bytes());
        buf[64..68].copy_from_slice(&self.length.to_le_bytes());
        put_str(&mut buf[68..196], &self.implementation_use);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, LabelError> {
        vfyansi_label(buf, PARTITION_DES)?;
        if buf.len() < DESCRIPTOR_LEN {
            return Err(LabelError::Malformed("short partition descriptor".into()));
        }
        let tag = DescriptorTag::from_bytes(buf)
            .ok_or_else(|| LabelError::Malformed("short descriptor tag".into()))?;
        Ok(Self {
            tag,
            sequence: le32(buf, 16),
            flags: le16(buf, 20),
            contents: get_str(&buf[25..48]),
            access_type: le32(buf, 56),
            starting_location: le32(buf, 60),
            length: le32(buf, 64),
            implementation_use: get_str(&buf[68..196]),
        })
    }
}

/// Verify the tag checksum and descriptor identifier of a raw descriptor
pub fn vfyansi_label(buf: &[u8], label_type: u16) -> Result<(), LabelError> {
    if buf.len() < TAG_LEN {
        return Err(LabelError::Malformed("descriptor shorter than its tag".into()));
    }
    let id = le16(buf, 0);
    if buf[4] != tag_checksum(buf) {
        return Err(LabelError::Malformed(format!(
            "descriptor tag checksum mismatch (id {})",
            id
        )));
    }
    if id != label_type {
        return Err(LabelError::Malformed(format!(
            "descriptor id {} where {} expected",
            id, label_type
        )));
    }
    Ok(())
}

/// Carry the sequence number forward: `new.sequence = old.sequence + 1`.
/// `new` is untouched when `old` does not verify.
pub fn upd_vol_label(old: &[u8], new: &mut PrimaryVolumeDescriptor) -> Result<(), LabelError> {
    vfyansi_label(old, PRIMARY_VOL_DES)?;
    new.sequence = le32(old, 16).wrapping_add(1);
    Ok(())
}

pub fn upd_part_label(old: &[u8], new: &mut PartitionDescriptor) -> Result<(), LabelError> {
    vfyansi_label(old, PARTITION_DES)?;
    new.sequence = le32(old, 16).wrapping_add(1);
    Ok(())
}

fn pad_to_sector(mut buf: Vec<u8>, sector_size: usize) -> Vec<u8> {
    if buf.len() < sector_size {
        buf.resize(sector_size, 0);
    }
    buf
}

fn write_descriptors(
    io: &dyn ScsiDevice,
    unit: &Unit,
    params: &LabelParams,
    relabel: bool,
) -> Result<(), LabelError> {
    let (worm, label_address, sector_size, total_sectors) = {
        let st = unit.lock();
        (
            st.media_worm,
            st.optical.label_address,
            st.optical.sector_size.max(DESCRIPTOR_LEN as u32) as usize,
            st.optical.total_sectors,
        )
    };

    let now = chrono::Local::now();
    let mut vol = PrimaryVolumeDescriptor::new(&params.vsn, params.info.as_deref(), &now);
    let mut par = PartitionDescriptor::new(total_sectors, params.info.as_deref());

    // WORM 不能覆盖，只能递增描述符序号
    if relabel && worm {
        debug!("eq {}: reading old labels at sector {}", unit.eq, label_address);
        let old = io
            .read_sectors(label_address, 2)
            .map_err(|e| LabelError::ReadOld(e.to_string()))?;
        if old.len() < sector_size * 2 {
            return Err(LabelError::ReadOld(format!(
                "read {} bytes, need {}",
                old.len(),
                sector_size * 2
            )));
        }
        upd_vol_label(&old[..sector_size], &mut vol)
            .and_then(|_| upd_part_label(&old[sector_size..sector_size * 2], &mut par))
            .map_err(|e| LabelError::CannotUpdate(e.to_string()))?;
    }

    unit.lock().status |= UnitStatus::LABELLING;

    let mut image = pad_to_sector(vol.to_bytes(), sector_size);
    image.extend_from_slice(&pad_to_sector(par.to_bytes(), sector_size));
    io.write_sectors(label_address, &image).map_err(|e| {
        error!("eq {}: optical label write failed: {}", unit.eq, e);
        LabelError::Write { written: 0 }
    })?;

    unit.lock().status = UnitStatus::PRESENT;
    info!(
        "eq {}: optical label {} written (sequence {})",
        unit.eq, params.vsn, vol.sequence
    );
    Ok(())
}

/// Write the primary volume and partition descriptors.
///
/// A labeled unit means a relabel; on WORM media the old descriptors are
/// read back so the sequence numbers keep increasing. `LABELLING` is always
/// cleared on return.
pub fn write_labels(io: &dyn ScsiDevice, unit: &Unit, params: &LabelParams) -> Result<(), LabelError> {
    let relabel = {
        let mut st = unit.lock();
        let labeled = st.status.contains(UnitStatus::LABELED);
        if labeled {
            debug!("eq {}: relabel {} -> {}", unit.eq, st.vsn, params.vsn);
            st.status.remove(UnitStatus::LABELED);
        }
        labeled
    };

    let result = write_descriptors(io, unit, params, relabel);
    if let Err(e) = &result {
        error!("eq {}: label {} failed: {}", unit.eq, params.vsn, e);
        unit.set_message(format!("label failed: {}", e));
    }
    unit.lock().status.remove(UnitStatus::LABELLING);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MediaType;
    use crate::device::DeviceClass;
    use crate::sim::{SimMedium, SimWorld};
    use chrono::Utc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 8, 15, 42).unwrap()
    }

    #[test]
    fn test_descriptor_round_trip() {
        let vol = PrimaryVolumeDescriptor::new("OPT001", Some("site A"), &now());
        let parsed = PrimaryVolumeDescriptor::from_bytes(&vol.to_bytes()).unwrap();
        assert_eq!(parsed.volume_id, "OPT001");
        assert_eq!(parsed.sequence, 1);
        assert_eq!(parsed.interchange_level, 3);
        assert_eq!(parsed.recorded.year, 2024);
        assert_eq!(parsed.recorded.second, 42);
        assert_eq!(parsed.implementation_use, "site A");

        let par = PartitionDescriptor::new(10_000, None);
        let parsed = PartitionDescriptor::from_bytes(&par.to_bytes()).unwrap();
        assert_eq!(parsed.contents, "*LSC01");
        assert_eq!(parsed.starting_location, 257);
        assert_eq!(parsed.length, 10_000 - 514);
        assert_eq!(parsed.access_type, 2);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut bytes = PrimaryVolumeDescriptor::new("X", None, &now()).to_bytes();
        assert!(vfyansi_label(&bytes, PRIMARY_VOL_DES).is_ok());
        assert!(vfyansi_label(&bytes, PARTITION_DES).is_err());
        bytes[12] ^= 0x01;
        assert!(vfyansi_label(&bytes, PRIMARY_VOL_DES).is_err());
    }

    #[test]
    fn test_worm_sequence_is_monotonic() {
        let mut old = PrimaryVolumeDescriptor::new("WRM001", None, &now());
        old.sequence = 7;
        let mut new = PrimaryVolumeDescriptor::new("WRM002", None, &now());
        upd_vol_label(&old.to_bytes(), &mut new).unwrap();
        assert_eq!(new.sequence, 8);

        let mut old_par = PartitionDescriptor::new(5000, None);
        old_par.sequence = 3;
        let mut new_par = PartitionDescriptor::new(5000, None);
        upd_part_label(&old_par.to_bytes(), &mut new_par).unwrap();
        assert_eq!(new_par.sequence, 4);
    }

    #[test]
    fn test_wrong_tag_leaves_new_untouched() {
        let old_par = PartitionDescriptor::new(5000, None).to_bytes();
        let mut new = PrimaryVolumeDescriptor::new("WRM002", None, &now());
        let before = new.clone();
        assert!(upd_vol_label(&old_par, &mut new).is_err());
        assert_eq!(new, before);
    }

    fn optical_unit(worm: bool, labeled: bool) -> Unit {
        Unit::new(30, "sim-mo0", DeviceClass::Optical).with_state(|st| {
            st.media_worm = worm;
            st.optical.total_sectors = 4096;
            st.status = UnitStatus::READY | UnitStatus::PRESENT;
            if labeled {
                st.status |= UnitStatus::LABELED;
                st.vsn = "WRM001".into();
            }
        })
    }

    #[test]
    fn test_worm_relabel_bumps_sequence_on_media() {
        let world = SimWorld::new();
        world.set_element(200, Some(SimMedium::optical("", MediaType::Worm, 4096)));
        let drive = world.drive(200, "sim-mo0");

        let unit = optical_unit(true, false);
        write_labels(&drive, &unit, &LabelParams::new("WRM001")).unwrap();
        assert_eq!(unit.status(), UnitStatus::PRESENT);

        unit.lock().status |= UnitStatus::LABELED;
        write_labels(&drive, &unit, &LabelParams::new("WRM002")).unwrap();

        let sectors = drive.read_sectors(0, 2).unwrap();
        let vol = PrimaryVolumeDescriptor::from_bytes(&sectors[..1024]).unwrap();
        let par = PartitionDescriptor::from_bytes(&sectors[1024..]).unwrap();
        assert_eq!(vol.volume_id, "WRM002");
        assert_eq!(vol.sequence, 2);
        assert_eq!(par.sequence, 2);
    }

    #[test]
    fn test_worm_relabel_of_garbage_fails() {
        let world = SimWorld::new();
        world.set_element(200, Some(SimMedium::optical("", MediaType::Worm, 4096)));
        let drive = world.drive(200, "sim-mo0");
        let unit = optical_unit(true, true);

        let err = write_labels(&drive, &unit, &LabelParams::new("WRM002")).unwrap_err();
        assert!(matches!(err, LabelError::CannotUpdate(_)));
        let st = unit.snapshot();
        assert!(!st.status.contains(UnitStatus::LABELLING));
        assert!(!st.status.contains(UnitStatus::LABELED));
    }
}
