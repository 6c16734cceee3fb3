use std::fmt;
use std::sync::Arc;

use crate::backend::{Backend, RuntimeKind};
use crate::device::Device;
use crate::properties::{DeviceDatabase, PropertyTable};
use crate::{NexusError, Result};

/// A discovered backend and its devices. Immutable after discovery.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    index: usize,
    name: String,
    kind: RuntimeKind,
    properties: PropertyTable,
    devices: Vec<Device>,
}

impl Runtime {
    pub(crate) fn new(index: usize, backend: Backend, database: &DeviceDatabase) -> Self {
        let backend = Arc::new(backend);
        let inner = Arc::new_cyclic(|weak| {
            let devices = (0..backend.device_count())
                .map(|i| Device::new(i, Arc::clone(&backend), weak.clone(), database))
                .collect();
            RuntimeInner {
                index,
                name: backend.name().to_string(),
                kind: backend.kind(),
                properties: backend.runtime_properties(),
                devices,
            }
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Self { inner }
    }

    /// Position in discovery order.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> RuntimeKind {
        self.inner.kind
    }

    pub fn properties(&self) -> &PropertyTable {
        &self.inner.properties
    }

    /// Devices in backend order.
    pub fn devices(&self) -> &[Device] {
        &self.inner.devices
    }

    pub fn device_count(&self) -> usize {
        self.inner.devices.len()
    }

    /// The device at `index`, `NotFound` when out of range.
    pub fn device(&self, index: usize) -> Result<Device> {
        self.inner.devices.get(index).cloned().ok_or_else(|| {
            NexusError::NotFound(format!(
                "device {} in runtime '{}' ({} devices)",
                index,
                self.inner.name,
                self.inner.devices.len()
            ))
        })
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("index", &self.inner.index)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("devices", &self.inner.devices.len())
            .finish()
    }
}
