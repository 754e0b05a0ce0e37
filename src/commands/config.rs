//! Config Command Handler

use std::path::PathBuf;
use tracing::info;

use crate::config::RobotConfig;
use crate::error::{Result, RobotError};

pub async fn execute(path: Option<PathBuf>, save: bool) -> Result<()> {
    let config = RobotConfig::load(path.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    if save {
        let target = RobotConfig::default_path()
            .ok_or_else(|| RobotError::config("no configuration directory on this system"))?;
        config.save(&target)?;
        info!("Configuration saved to {}", target.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_print_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        RobotConfig::default().save(&path).unwrap();
        execute(Some(path), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(execute(Some(path), false).await.is_err());
    }
}
