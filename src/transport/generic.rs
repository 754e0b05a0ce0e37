//! SCSI medium changer transport
//!
//! Builds MOVE MEDIUM and READ ELEMENT STATUS CDBs and sends them through a
//! [`CommandChannel`]. Check conditions are turned into [`MoveError`]s.

use std::sync::Arc;
use tracing::{debug, warn};

use super::{DriveQuery, MediaTransport, MoveError, TransportKind};
use crate::scsi::{element_types, scsi_commands, ScsiError, ScsiResult};

const ELEMENT_HEADER_LEN: usize = 8;
const PAGE_HEADER_LEN: usize = 8;
const VOLTAG_LEN: usize = 36;
const DESCRIPTOR_LEN: usize = 12 + VOLTAG_LEN;
const PVOLTAG: u8 = 0x80;

/// Pass-through command path to a changer device
pub trait CommandChannel: Send + Sync {
    /// Issue `cdb`, returning at most `data_in_len` bytes of data-in
    fn execute(&self, cdb: &[u8], data_in_len: usize) -> ScsiResult<Vec<u8>>;
}

pub fn move_medium_cdb(transport: u16, src: u16, dst: u16, invert: bool) -> [u8; 12] {
    let mut cmd = [0u8; 12];
    cmd[0] = scsi_commands::MOVE_MEDIUM;
    cmd[2..4].copy_from_slice(&transport.to_be_bytes());
    cmd[4..6].copy_from_slice(&src.to_be_bytes());
    cmd[6..8].copy_from_slice(&dst.to_be_bytes());
    cmd[10] = if invert { 1 } else { 0 };
    cmd
}

pub fn read_element_status_cdb(start: u16, count: u16, element_type: u8, alloc_len: u32) -> [u8; 12] {
    let volume_tag_bit = 1u8 << 4;
    let mut cmd = [0u8; 12];
    cmd[0] = scsi_commands::READ_ELEMENT_STATUS;
    cmd[1] = volume_tag_bit | (element_type & 0x0f);
    cmd[2..4].copy_from_slice(&start.to_be_bytes());
    cmd[4..6].copy_from_slice(&count.to_be_bytes());
    cmd[7..10].copy_from_slice(&alloc_len.to_be_bytes()[1..4]);
    cmd
}

/// Encode a data transfer element status page (one page, volume tags on)
pub fn encode_drive_status(drives: &[DriveQuery]) -> Vec<u8> {
    let body_len = drives.len() * DESCRIPTOR_LEN;
    let mut out = Vec::with_capacity(ELEMENT_HEADER_LEN + PAGE_HEADER_LEN + body_len);

    let first = drives.first().map(|d| d.element as u16).unwrap_or(0);
    out.extend_from_slice(&first.to_be_bytes());
    out.extend_from_slice(&(drives.len() as u16).to_be_bytes());
    out.push(0);
    out.extend_from_slice(&((PAGE_HEADER_LEN + body_len) as u32).to_be_bytes()[1..4]);

    out.push(element_types::DATA_TRANSFER);
    out.push(PVOLTAG);
    out.extend_from_slice(&(DESCRIPTOR_LEN as u16).to_be_bytes());
    out.push(0);
    out.extend_from_slice(&(body_len as u32).to_be_bytes()[1..4]);

    for drive in drives {
        let mut desc = [0u8; DESCRIPTOR_LEN];
        desc[0..2].copy_from_slice(&(drive.element as u16).to_be_bytes());
        desc[2] = if drive.full { 0x01 } else { 0 };
        if let Some(src) = drive.source {
            desc[9] = 0x80 | if drive.invert { 0x40 } else { 0 };
            desc[10..12].copy_from_slice(&(src as u16).to_be_bytes());
        }
        let tag = drive.barcode.as_deref().unwrap_or("");
        let mut voltag = [b' '; VOLTAG_LEN];
        let n = tag.len().min(32);
        voltag[..n].copy_from_slice(&tag.as_bytes()[..n]);
        desc[12..].copy_from_slice(&voltag);
        out.extend_from_slice(&desc);
    }
    out
}

/// Decode the pages produced by READ ELEMENT STATUS for data transfer elements
pub fn decode_drive_status(data: &[u8]) -> Result<Vec<DriveQuery>, MoveError> {
    let short = || MoveError::Failed("element status data truncated".into());
    if data.len() < ELEMENT_HEADER_LEN {
        return Err(short());
    }
    let report_len = u32::from_be_bytes([0, data[5], data[6], data[7]]) as usize;
    let end = (ELEMENT_HEADER_LEN + report_len).min(data.len());
    let mut pos = ELEMENT_HEADER_LEN;
    let mut drives = Vec::new();

    while pos + PAGE_HEADER_LEN <= end {
        let page = &data[pos..pos + PAGE_HEADER_LEN];
        let element_type = page[0] & 0x0f;
        let voltag = page[1] & PVOLTAG != 0;
        let desc_len = u16::from_be_bytes([page[2], page[3]]) as usize;
        let page_len = u32::from_be_bytes([0, page[5], page[6], page[7]]) as usize;
        pos += PAGE_HEADER_LEN;
        let page_end = (pos + page_len).min(end);
        if desc_len < 12 {
            return Err(short());
        }

        while pos + desc_len <= page_end {
            let desc = &data[pos..pos + desc_len];
            if element_type == element_types::DATA_TRANSFER {
                let svalid = desc[9] & 0x80 != 0;
                let barcode = if voltag && desc_len >= 12 + VOLTAG_LEN {
                    let text = String::from_utf8_lossy(&desc[12..44]).trim().to_string();
                    (!text.is_empty()).then_some(text)
                } else {
                    None
                };
                drives.push(DriveQuery {
                    element: u16::from_be_bytes([desc[0], desc[1]]) as u32,
                    full: desc[2] & 0x01 != 0,
                    source: svalid.then(|| u16::from_be_bytes([desc[10], desc[11]]) as u32),
                    barcode,
                    invert: svalid && desc[9] & 0x40 != 0,
                });
            }
            pos += desc_len;
        }
        pos = page_end;
    }
    Ok(drives)
}

pub struct GenericScsiTransport {
    channel: Arc<dyn CommandChannel>,
    drive_elements: Vec<u32>,
}

impl GenericScsiTransport {
    pub fn new(channel: Arc<dyn CommandChannel>, drive_elements: Vec<u32>) -> Self {
        Self {
            channel,
            drive_elements,
        }
    }

    fn element(addr: u32) -> Result<u16, MoveError> {
        u16::try_from(addr).map_err(|_| MoveError::Failed(format!("element {} out of range", addr)))
    }

    fn map_error(err: ScsiError) -> MoveError {
        match err.sense() {
            Some(sense) => MoveError::from_sense(&sense),
            None => MoveError::Failed(err.to_string()),
        }
    }
}

impl MediaTransport for GenericScsiTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::GenericScsi
    }

    fn move_media(&self, transport: u32, src: u32, dst: u32, invert: bool) -> Result<(), MoveError> {
        let cmd = move_medium_cdb(
            Self::element(transport)?,
            Self::element(src)?,
            Self::element(dst)?,
            invert,
        );
        debug!("MOVE MEDIUM {} -> {} (invert {})", src, dst, invert);
        self.channel.execute(&cmd, 0).map(|_| ()).map_err(|e| {
            let err = Self::map_error(e);
            warn!("MOVE MEDIUM {} -> {} failed: {}", src, dst, err);
            err
        })
    }

    fn query_drive(&self, element: u32) -> Result<DriveQuery, MoveError> {
        let alloc = (ELEMENT_HEADER_LEN + PAGE_HEADER_LEN + DESCRIPTOR_LEN) as u32;
        let cmd = read_element_status_cdb(
            Self::element(element)?,
            1,
            element_types::DATA_TRANSFER,
            alloc,
        );
        let data = self
            .channel
            .execute(&cmd, alloc as usize)
            .map_err(Self::map_error)?;
        decode_drive_status(&data)?
            .into_iter()
            .find(|d| d.element == element)
            .ok_or_else(|| MoveError::Failed(format!("no status for element {}", element)))
    }

    fn query_all_drives(&self) -> Result<Vec<DriveQuery>, MoveError> {
        self.drive_elements
            .iter()
            .map(|&element| self.query_drive(element))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::SenseData;
    use parking_lot::Mutex;

    struct Recorder {
        cdbs: Mutex<Vec<Vec<u8>>>,
        reply: ScsiResult<Vec<u8>>,
    }

    impl CommandChannel for Recorder {
        fn execute(&self, cdb: &[u8], _data_in_len: usize) -> ScsiResult<Vec<u8>> {
            self.cdbs.lock().push(cdb.to_vec());
            self.reply.clone()
        }
    }

    #[test]
    fn test_move_medium_cdb_layout() {
        let cmd = move_medium_cdb(1, 1005, 500, true);
        assert_eq!(cmd[0], 0xA5);
        assert_eq!(&cmd[2..4], &[0, 1]);
        assert_eq!(u16::from_be_bytes([cmd[4], cmd[5]]), 1005);
        assert_eq!(u16::from_be_bytes([cmd[6], cmd[7]]), 500);
        assert_eq!(cmd[10], 1);
    }

    #[test]
    fn test_status_page_round_trip() {
        let drives = vec![
            DriveQuery {
                element: 500,
                full: true,
                source: Some(1003),
                barcode: Some("VSN003L6".into()),
                invert: false,
            },
            DriveQuery {
                element: 501,
                ..Default::default()
            },
        ];
        let decoded = decode_drive_status(&encode_drive_status(&drives)).unwrap();
        assert_eq!(decoded, drives);
    }

    #[test]
    fn test_move_maps_check_condition() {
        let channel = Arc::new(Recorder {
            cdbs: Mutex::new(Vec::new()),
            reply: Err(ScsiError::Check(SenseData::new(0x05, 0x3B, 0x0E))),
        });
        let transport = GenericScsiTransport::new(channel.clone(), vec![500]);
        assert_eq!(
            transport.move_media(1, 1000, 500, false),
            Err(MoveError::SourceEmpty)
        );
        assert_eq!(channel.cdbs.lock()[0][0], scsi_commands::MOVE_MEDIUM);
    }

    #[test]
    fn test_query_drive_decodes_reply() {
        let page = encode_drive_status(&[DriveQuery {
            element: 500,
            full: true,
            source: Some(1001),
            barcode: None,
            invert: false,
        }]);
        let channel = Arc::new(Recorder {
            cdbs: Mutex::new(Vec::new()),
            reply: Ok(page),
        });
        let transport = GenericScsiTransport::new(channel, vec![500]);
        let q = transport.query_drive(500).unwrap();
        assert!(q.full);
        assert_eq!(q.source, Some(1001));
        assert_eq!(transport.query_all_drives().unwrap().len(), 1);
    }
}
