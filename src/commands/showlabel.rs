//! Showlabel Command Handler

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cli::LabelKind;
use crate::error::{Result, RobotError};
use crate::labels::optical::DESCRIPTOR_LEN;
use crate::labels::tape::TapeLabelInfo;
use crate::labels::{PartitionDescriptor, PrimaryVolumeDescriptor, TapeLabels};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedLabel {
    Tape(TapeLabelInfo),
    Optical {
        volume: PrimaryVolumeDescriptor,
        partition: PartitionDescriptor,
    },
}

pub fn decode(kind: LabelKind, image: &[u8]) -> Result<DecodedLabel> {
    match kind {
        LabelKind::Tape => Ok(DecodedLabel::Tape(TapeLabels::from_bytes(image)?.info()?)),
        LabelKind::Optical => {
            if image.len() < DESCRIPTOR_LEN * 2 {
                return Err(RobotError::parse(format!(
                    "optical label image is {} bytes, need {}",
                    image.len(),
                    DESCRIPTOR_LEN * 2
                )));
            }
            Ok(DecodedLabel::Optical {
                volume: PrimaryVolumeDescriptor::from_bytes(&image[..DESCRIPTOR_LEN])?,
                partition: PartitionDescriptor::from_bytes(
                    &image[DESCRIPTOR_LEN..DESCRIPTOR_LEN * 2],
                )?,
            })
        }
    }
}

pub fn decode_file(kind: LabelKind, path: &Path) -> Result<DecodedLabel> {
    let image = fs::read(path)?;
    decode(kind, &image)
}

fn print_text(label: &DecodedLabel) {
    match label {
        DecodedLabel::Tape(info) => {
            println!("🏷️  Tape Label:");
            println!("  VSN: {}", info.vsn);
            println!("  Implementation: {}", info.implementation_id);
            println!("  File Identifier: {}", info.file_identifier);
            match &info.creation_date {
                Some(date) => println!("  Created: {}", date),
                None => println!("  Created: (none)"),
            }
            println!("  Block Size: {} bytes", info.block_size);
            println!("  Label Time: {}", info.label_time);
        }
        DecodedLabel::Optical { volume, partition } => {
            println!("🏷️  Optical Label:");
            println!("  Volume: {}", volume.volume_id);
            println!("  Sequence: {}", volume.sequence);
            println!("  Info: {}", volume.implementation_use);
            println!("  Partition: {}", partition.contents);
            println!(
                "  Sectors: {} from {}",
                partition.length, partition.starting_location
            );
        }
    }
}

pub async fn execute(kind: LabelKind, image: PathBuf, json: bool) -> Result<()> {
    info!("Decoding {:?} label image {}", kind, image.display());
    let label = decode_file(kind, &image)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&label)?);
    } else {
        print_text(&label);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::mklabel::build_image;

    #[test]
    fn test_decode_tape() {
        let image = build_image(LabelKind::Tape, "ABC123", Some("backup"), 65536, 0).unwrap();
        match decode(LabelKind::Tape, &image).unwrap() {
            DecodedLabel::Tape(info) => {
                assert_eq!(info.vsn, "ABC123");
                assert_eq!(info.file_identifier, "backup");
                assert_eq!(info.block_size, 65536);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let image = build_image(LabelKind::Tape, "ABC123", None, 0, 0).unwrap();
        assert!(decode(LabelKind::Optical, &image).is_err());
        assert!(decode(LabelKind::Tape, &image[..100]).is_err());
    }

    #[test]
    fn test_json_has_kind_tag() {
        let image = build_image(LabelKind::Optical, "OPT1", None, 0, 8192).unwrap();
        let label = decode(LabelKind::Optical, &image).unwrap();
        let value = serde_json::to_value(&label).unwrap();
        assert_eq!(value["kind"], "optical");
        assert_eq!(value["volume"]["volume_id"], "OPT1");
    }

    #[tokio::test]
    async fn test_execute_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.img");
        fs::write(&path, build_image(LabelKind::Tape, "T00001", None, 0, 0).unwrap()).unwrap();
        execute(LabelKind::Tape, path, true).await.unwrap();
    }
}
