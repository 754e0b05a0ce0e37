// SCSI constant definitions used by the drive and changer paths

// SCSI Commands Module
pub mod scsi_commands {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REZERO_UNIT: u8 = 0x01;
    pub const READ_6: u8 = 0x08;
    pub const WRITE_6: u8 = 0x0A;
    pub const WRITE_FILEMARKS: u8 = 0x10;
    pub const SPACE: u8 = 0x11;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SELECT_6: u8 = 0x15;
    pub const ERASE: u8 = 0x19;
    pub const START_STOP_UNIT: u8 = 0x1B;
    pub const READ_CAPACITY: u8 = 0x25;
    pub const LOG_SENSE: u8 = 0x4D;
    pub const MOVE_MEDIUM: u8 = 0xA5;
    pub const READ_ELEMENT_STATUS: u8 = 0xB8;
}

/// Sense keys (SPC-4 table 27)
pub mod sense_keys {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const BLANK_CHECK: u8 = 0x08;
}

/// Additional sense codes the orchestration logic cares about
pub mod asc {
    pub const NO_ADDITIONAL: u8 = 0x00;
    pub const LOGICAL_UNIT_NOT_READY: u8 = 0x04;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const MEDIUM_MAY_HAVE_CHANGED: u8 = 0x28;
    pub const POWER_ON_RESET: u8 = 0x29;
    pub const INCOMPATIBLE_MEDIUM: u8 = 0x30;
    pub const MEDIUM_FORMAT_CORRUPTED: u8 = 0x31;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    pub const MEDIUM_SOURCE_ELEMENT: u8 = 0x3B;

    /// ASCQ paired with NO_ADDITIONAL meaning "drive requests cleaning"
    pub const ASCQ_CLEANING_REQUESTED: u8 = 0x17;
    /// ASCQ paired with INCOMPATIBLE_MEDIUM meaning "cleaning cartridge installed"
    pub const ASCQ_CLEANING_CARTRIDGE: u8 = 0x03;
    pub const ASCQ_BECOMING_READY: u8 = 0x01;
    /// MEDIUM_SOURCE_ELEMENT qualifiers
    pub const ASCQ_DESTINATION_FULL: u8 = 0x0D;
    pub const ASCQ_SOURCE_EMPTY: u8 = 0x0E;
}

pub mod block_sizes {
    /// Smallest block a tape label may declare
    pub const TAPE_SECTOR_SIZE: u32 = 1024;
    pub const DEFAULT_BLOCK_SIZE: u32 = 262144; // 256KB
    pub const MAX_BLOCK_SIZE: u32 = 2097152; // 2MB
    pub const OPTICAL_SECTOR_SIZE: u32 = 1024;
}

/// Element type codes used in READ ELEMENT STATUS
pub mod element_types {
    pub const ALL: u8 = 0x00;
    pub const MEDIUM_TRANSPORT: u8 = 0x01;
    pub const STORAGE: u8 = 0x02;
    pub const IMPORT_EXPORT: u8 = 0x03;
    pub const DATA_TRANSFER: u8 = 0x04;
}
