//! sam-robotd library
//!
//! Orchestration core of a robotic media library: a coordinator thread per
//! library and a worker thread per drive that mount, label, clean and
//! audit removable tape and optical media on behalf of filesystem clients.

pub mod catalog;
pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod device;
pub mod drive;
pub mod error;
pub mod event;
pub mod labels;
pub mod library;
pub mod logger;
pub mod preview;
pub mod scsi;
pub mod sim;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export key types for easier use
pub use catalog::{Catalog, CatalogEntry, CeStatus, MediaType, MemoryCatalog};
pub use config::RobotConfig;
pub use context::RobotContext;
pub use device::{DeviceState, Unit, UnitStatus};
pub use error::{Errno, Result, RobotError};
pub use event::{Command, Completion, Event};
pub use library::{Library, LibraryHandle};
pub use preview::{PreviewEntry, PreviewNotice, PreviewTable};
