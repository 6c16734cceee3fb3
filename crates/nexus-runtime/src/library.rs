use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::{KernelEntry, ModuleRef};
use crate::device::DeviceShared;
use crate::handle::{DeviceId, LibraryId};
use crate::{NexusError, Result};

/// A kernel module loaded on one device.
///
/// Returned from [`Device::load_library`](crate::Device::load_library); loading
/// the same path again on the same device yields this same library.
#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

struct LibraryInner {
    id: LibraryId,
    path: PathBuf,
    device_id: DeviceId,
    device: Weak<DeviceShared>,
    module: Arc<ModuleRef>,
    kernels: Mutex<HashMap<String, Kernel>>,
}

impl Library {
    pub(crate) fn new(path: &Path, module: ModuleRef, device: &Arc<DeviceShared>) -> Self {
        Self {
            inner: Arc::new(LibraryInner {
                id: LibraryId::next(),
                path: path.to_path_buf(),
                device_id: device.id(),
                device: Arc::downgrade(device),
                module: Arc::new(module),
                kernels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> LibraryId {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Resolve a kernel by entry name. `NotFound` if the module has no such entry.
    pub fn get_kernel(&self, name: &str) -> Result<Kernel> {
        if self.inner.device.strong_count() == 0 {
            return Err(NexusError::InvalidState(format!(
                "{}: owning device has been torn down",
                self.inner.id
            )));
        }
        let mut kernels = self.inner.kernels.lock();
        if let Some(kernel) = kernels.get(name) {
            return Ok(kernel.clone());
        }
        let (slot_count, entry) = self.inner.module.lookup(name).map_err(|e| match e {
            NexusError::NotFound(_) => NexusError::NotFound(format!(
                "kernel '{}' in {}",
                name,
                self.inner.path.display()
            )),
            other => other,
        })?;
        let kernel = Kernel {
            inner: Arc::new(KernelInner {
                name: name.to_string(),
                slot_count,
                entry,
                library_id: self.inner.id,
                device_id: self.inner.device_id,
                _module: Arc::clone(&self.inner.module),
            }),
        };
        tracing::debug!("resolved kernel '{}' ({} slots) in {}", name, slot_count, self.inner.id);
        kernels.insert(name.to_string(), kernel.clone());
        Ok(kernel)
    }

    /// Every entry point in the module. Plugin modules cannot be enumerated
    /// and report only the kernels resolved so far.
    pub fn kernel_names(&self) -> Vec<String> {
        self.inner.module.kernel_names().unwrap_or_else(|| {
            let mut names: Vec<String> = self.inner.kernels.lock().keys().cloned().collect();
            names.sort();
            names
        })
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("device", &self.inner.device_id)
            .finish()
    }
}

/// A named entry point inside a [`Library`].
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

struct KernelInner {
    name: String,
    slot_count: u32,
    entry: KernelEntry,
    library_id: LibraryId,
    device_id: DeviceId,
    // Keeps the module loaded for as long as the kernel is reachable.
    _module: Arc<ModuleRef>,
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of buffer slots that must be bound before a command can finalize.
    pub fn slot_count(&self) -> u32 {
        self.inner.slot_count
    }

    pub fn library_id(&self) -> LibraryId {
        self.inner.library_id
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    pub(crate) fn entry(&self) -> KernelEntry {
        self.inner.entry
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.inner.name)
            .field("slot_count", &self.inner.slot_count)
            .field("library", &self.inner.library_id)
            .finish()
    }
}
