use std::collections::HashMap;
use std::sync::Arc;

use shellgate_common::protocols::{Driver, DriverCapabilities};

/// Protocol drivers keyed by protocol id. Built once at startup, then
/// read-only.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.protocol(), driver);
    }

    pub fn get(&self, protocol_id: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(protocol_id).cloned()
    }

    pub fn capabilities(&self, protocol_id: &str) -> Option<DriverCapabilities> {
        self.drivers.get(protocol_id).map(|d| d.capabilities())
    }

    pub fn protocols(&self) -> Vec<&'static str> {
        self.drivers.keys().copied().collect()
    }
}
