use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::scsi::ScsiError;

pub type Result<T> = std::result::Result<T, RobotError>;

#[derive(Error, Debug)]
pub enum RobotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SCSI operation error: {0}")]
    Scsi(String),

    #[error("Media transport error: {0}")]
    Transport(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Label error: {0}")]
    Label(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Parameter validation error: {0}")]
    ParameterValidation(String),

    #[error("Invalid device state: {0}")]
    InvalidState(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl RobotError {
    pub fn scsi<T: Into<String>>(msg: T) -> Self {
        Self::Scsi(msg.into())
    }

    pub fn transport<T: Into<String>>(msg: T) -> Self {
        Self::Transport(msg.into())
    }

    pub fn catalog<T: Into<String>>(msg: T) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn label<T: Into<String>>(msg: T) -> Self {
        Self::Label(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn parse<T: Into<String>>(msg: T) -> Self {
        Self::Parse(msg.into())
    }

    pub fn parameter_validation<T: Into<String>>(msg: T) -> Self {
        Self::ParameterValidation(msg.into())
    }

    pub fn invalid_state<T: Into<String>>(msg: T) -> Self {
        Self::InvalidState(msg.into())
    }
}

impl From<ScsiError> for RobotError {
    fn from(err: ScsiError) -> Self {
        Self::Scsi(err.to_string())
    }
}

/// Completion code handed back to the original requester of an event or
/// preview entry. Numeric values follow POSIX errno.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Errno {
    Ok,
    EACCES,
    EIO,
    ENOENT,
    EAGAIN,
    ECANCELED,
    EINVAL,
    EEXIST,
    ENOSPC,
    ENXIO,
}

impl Errno {
    pub fn code(self) -> i32 {
        match self {
            Errno::Ok => 0,
            Errno::ENOENT => 2,
            Errno::EIO => 5,
            Errno::ENXIO => 6,
            Errno::EAGAIN => 11,
            Errno::EACCES => 13,
            Errno::EEXIST => 17,
            Errno::EINVAL => 22,
            Errno::ENOSPC => 28,
            Errno::ECANCELED => 125,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Errno::Ok
    }

    pub fn name(self) -> &'static str {
        match self {
            Errno::Ok => "OK",
            Errno::EACCES => "EACCES",
            Errno::EIO => "EIO",
            Errno::ENOENT => "ENOENT",
            Errno::EAGAIN => "EAGAIN",
            Errno::ECANCELED => "ECANCELED",
            Errno::EINVAL => "EINVAL",
            Errno::EEXIST => "EEXIST",
            Errno::ENOSPC => "ENOSPC",
            Errno::ENXIO => "ENXIO",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RobotError::scsi("move medium failed");
        assert!(matches!(err, RobotError::Scsi(_)));

        let err = RobotError::catalog("slot 4 not found");
        assert_eq!(err.to_string(), "Catalog error: slot 4 not found");
    }

    #[test]
    fn test_errno_codes() {
        assert_eq!(Errno::Ok.code(), 0);
        assert_eq!(Errno::EIO.code(), 5);
        assert_eq!(Errno::ECANCELED.code(), 125);
        assert!(Errno::Ok.is_ok());
        assert!(!Errno::EAGAIN.is_ok());
        assert_eq!(Errno::EACCES.to_string(), "EACCES (13)");
    }
}
