//! Process-wide context shared by the library and drive threads

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::{Defaults, RobotConfig, Timing};
use crate::device::{DeviceRegistry, Unit};
use crate::preview::PreviewTable;

/// Built once at startup and handed to every constructor as an `Arc`
pub struct RobotContext {
    pub config: RobotConfig,
    pub registry: DeviceRegistry,
    pub catalog: Arc<dyn Catalog>,
    pub previews: PreviewTable,
}

impl RobotContext {
    pub fn new(config: RobotConfig, registry: DeviceRegistry, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            config,
            registry,
            catalog,
            previews: PreviewTable::new(),
        }
    }

    pub fn defaults(&self) -> &Defaults {
        &self.config.defaults
    }

    pub fn timing(&self) -> &Timing {
        &self.config.timing
    }

    pub fn unit(&self, eq: u16) -> Option<&Arc<Unit>> {
        self.registry.get(eq)
    }
}
