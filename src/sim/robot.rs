use std::sync::Arc;

use super::SimWorld;
use crate::scsi::{scsi_commands, ScsiError, ScsiResult, SenseData};
use crate::transport::generic::encode_drive_status;
use crate::transport::{CommandChannel, DriveQuery, MediaTransport, MoveError, TransportKind};

/// Robot moving cartridges directly in the world
pub struct SimRobot {
    world: Arc<SimWorld>,
}

impl SimRobot {
    pub fn new(world: Arc<SimWorld>) -> Self {
        Self { world }
    }
}

impl MediaTransport for SimRobot {
    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    fn move_media(&self, _transport: u32, src: u32, dst: u32, invert: bool) -> Result<(), MoveError> {
        self.world.do_move(src, dst, invert)
    }

    fn query_drive(&self, element: u32) -> Result<DriveQuery, MoveError> {
        self.world.query(element)
    }

    fn query_all_drives(&self) -> Result<Vec<DriveQuery>, MoveError> {
        self.world
            .drive_elements()
            .into_iter()
            .map(|e| self.world.query(e))
            .collect()
    }
}

/// Medium changer answering raw CDBs
pub struct SimChanger {
    world: Arc<SimWorld>,
}

impl SimChanger {
    pub fn new(world: Arc<SimWorld>) -> Self {
        Self { world }
    }

    fn sense_for(err: &MoveError) -> SenseData {
        match err {
            MoveError::Recovered => SenseData::new(0x01, 0x00, 0x00),
            MoveError::Incompatible => SenseData::new(0x05, 0x30, 0x00),
            MoveError::SourceEmpty => SenseData::new(0x05, 0x3B, 0x0E),
            MoveError::DestinationFull => SenseData::new(0x05, 0x3B, 0x0D),
            MoveError::Failed(_) => SenseData::new(0x04, 0x40, 0x00),
        }
    }
}

impl CommandChannel for SimChanger {
    fn execute(&self, cdb: &[u8], data_in_len: usize) -> ScsiResult<Vec<u8>> {
        if cdb.len() < 12 {
            return Err(ScsiError::Check(SenseData::new(0x05, 0x24, 0x00)));
        }
        let be16 = |at: usize| u16::from_be_bytes([cdb[at], cdb[at + 1]]) as u32;

        match cdb[0] {
            scsi_commands::MOVE_MEDIUM => {
                let (src, dst, invert) = (be16(4), be16(6), cdb[10] & 0x01 != 0);
                self.world
                    .do_move(src, dst, invert)
                    .map(|_| Vec::new())
                    .map_err(|e| ScsiError::Check(Self::sense_for(&e)))
            }
            scsi_commands::READ_ELEMENT_STATUS => {
                let (start, count) = (be16(2), be16(4) as usize);
                let drives: Vec<DriveQuery> = self
                    .world
                    .drive_elements()
                    .into_iter()
                    .filter(|&e| e >= start)
                    .take(count)
                    .filter_map(|e| self.world.query(e).ok())
                    .collect();
                let mut data = encode_drive_status(&drives);
                data.truncate(data_in_len);
                Ok(data)
            }
            _ => Err(ScsiError::Check(SenseData::new(0x05, 0x20, 0x00))),
        }
    }
}
