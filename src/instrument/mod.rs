//! Device protocols known to the worker.

pub mod tpg201;

use crate::device::DeviceProtocol;
use crate::error::{AppResult, DaqError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a fresh protocol instance.
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn DeviceProtocol> + Send + Sync>;

/// Maps device type names (as used in the `[worker] device` setting) to
/// protocol factories.
#[derive(Clone, Default)]
pub struct InstrumentCatalog {
    factories: BTreeMap<String, ProtocolFactory>,
}

impl InstrumentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every protocol shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register_factory(
            "tpg201",
            Arc::new(|| Box::new(tpg201::Tpg201) as Box<dyn DeviceProtocol>),
        );
        catalog
    }

    pub fn register_factory(&mut self, device_type: impl Into<String>, factory: ProtocolFactory) {
        self.factories.insert(device_type.into(), factory);
    }

    /// Looks up the factory of `device_type`.
    pub fn factory(&self, device_type: &str) -> AppResult<ProtocolFactory> {
        self.factories.get(device_type).cloned().ok_or_else(|| {
            DaqError::Configuration(format!(
                "Unsupported device type: {device_type} (known: {})",
                self.device_types().join(", ")
            ))
        })
    }

    pub fn build(&self, device_type: &str) -> AppResult<Box<dyn DeviceProtocol>> {
        Ok((self.factory(device_type)?)())
    }

    /// Registered names, sorted.
    pub fn device_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for InstrumentCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentCatalog")
            .field("device_types", &self.device_types())
            .finish()
    }
}
