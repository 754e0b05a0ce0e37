//! Mklabel Command Handler
//!
//! Writes the label records a drive would put on new media to a file.

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cli::LabelKind;
use crate::error::{Result, RobotError};
use crate::labels::{
    clamp_block_size, LabelParams, PartitionDescriptor, PrimaryVolumeDescriptor, TapeLabels,
    LEN_OPTIC_VSN, LEN_TAPE_VSN,
};
use crate::scsi::block_sizes::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};

/// Label image bytes for `vsn`
pub fn build_image(
    kind: LabelKind,
    vsn: &str,
    info: Option<&str>,
    block_size: u32,
    sectors: u32,
) -> Result<Vec<u8>> {
    let max = match kind {
        LabelKind::Tape => LEN_TAPE_VSN,
        LabelKind::Optical => LEN_OPTIC_VSN,
    };
    if vsn.is_empty() || vsn.len() > max {
        return Err(RobotError::parameter_validation(format!(
            "VSN {:?} must be 1 to {} characters",
            vsn, max
        )));
    }

    let now = Local::now();
    let image = match kind {
        LabelKind::Tape => {
            let mut params = LabelParams::new(vsn);
            params.info = info.map(str::to_string);
            let size = clamp_block_size(block_size, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE);
            TapeLabels::build(&params, size, &now).to_bytes()
        }
        LabelKind::Optical => {
            let mut image = PrimaryVolumeDescriptor::new(vsn, info, &now).to_bytes();
            image.extend(PartitionDescriptor::new(sectors, info).to_bytes());
            image
        }
    };
    Ok(image)
}

pub fn write_image(path: &Path, image: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, image)?;
    Ok(())
}

pub async fn execute(
    kind: LabelKind,
    vsn: String,
    output: PathBuf,
    block_size: u32,
    info: Option<String>,
    sectors: u32,
) -> Result<()> {
    info!("Building {:?} label for {}", kind, vsn);
    let image = build_image(kind, &vsn, info.as_deref(), block_size, sectors)?;
    write_image(&output, &image)?;
    println!("{} bytes written to {}", image.len(), output.display());
    Ok(())
}
