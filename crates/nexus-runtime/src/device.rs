use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::{Backend, DeviceMemory};
use crate::buffer::{validate_size, Buffer, BufferState};
use crate::dtype::DataType;
use crate::handle::{BufferId, DeviceId};
use crate::host::HostRegion;
use crate::library::Library;
use crate::loader::{self, ModuleSource};
use crate::properties::{keys, DeviceDatabase, PropertyTable};
use crate::runtime::{Runtime, RuntimeInner};
use crate::schedule::Schedule;
use crate::{NexusError, Result};

/// Device memory and its sync state.
pub(crate) struct BufferSlot {
    pub memory: DeviceMemory,
    pub state: BufferState,
}

/// The device's single execution queue.
///
/// Holding this lock is what serialises schedule runs against each other and
/// against buffer transfers.
#[derive(Default)]
pub(crate) struct DeviceQueue {
    buffers: HashMap<BufferId, BufferSlot>,
}

fn released(id: BufferId) -> NexusError {
    NexusError::InvalidState(format!("{id} has been released"))
}

impl DeviceQueue {
    pub fn contains(&self, id: BufferId) -> bool {
        self.buffers.contains_key(&id)
    }

    pub fn slot_mut(&mut self, id: BufferId) -> Result<&mut BufferSlot> {
        self.buffers.get_mut(&id).ok_or_else(|| released(id))
    }

    pub fn set_state(&mut self, id: BufferId, state: BufferState) {
        if let Some(slot) = self.buffers.get_mut(&id) {
            slot.state = state;
        }
    }

    pub fn remove(&mut self, id: BufferId) -> Result<BufferSlot> {
        self.buffers.remove(&id).ok_or_else(|| released(id))
    }
}

pub(crate) struct DeviceShared {
    id: DeviceId,
    index: usize,
    pub(crate) backend: Arc<Backend>,
    runtime: Weak<RuntimeInner>,
    info: PropertyTable,
    pub(crate) queue: Mutex<DeviceQueue>,
    libraries: Mutex<HashMap<ModuleSource, Library>>,
}

impl DeviceShared {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Index within the owning runtime, as the backend numbers it.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        let live = self.queue.get_mut().buffers.len();
        if live > 0 {
            tracing::debug!("{}: teardown frees {} live buffer(s)", self.id, live);
        }
    }
}

/// One compute device of a [`Runtime`].
///
/// Owns the buffers and libraries created through it; those hand back only
/// weak references, so they fail with `InvalidState` once the device is gone.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub(crate) fn new(
        index: usize,
        backend: Arc<Backend>,
        runtime: Weak<RuntimeInner>,
        database: &DeviceDatabase,
    ) -> Self {
        let mut info = backend.device_properties(index);
        let arch = info.get(keys::ARCHITECTURE).ok().map(str::to_owned);
        if let Some(entry) = arch.and_then(|arch| database.lookup(&arch).ok()) {
            info.merge_missing(entry);
        }
        let shared = Arc::new(DeviceShared {
            id: DeviceId::next(),
            index,
            backend,
            runtime,
            info,
            queue: Mutex::new(DeviceQueue::default()),
            libraries: Mutex::new(HashMap::new()),
        });
        tracing::debug!("{}: {} device {}", shared.id, shared.backend.name(), index);
        Self { shared }
    }

    pub fn id(&self) -> DeviceId {
        self.shared.id
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// The `name` property, or an empty string if the backend reports none.
    pub fn name(&self) -> &str {
        self.shared.info.get(keys::NAME).unwrap_or("")
    }

    /// The runtime this device was discovered under.
    pub fn runtime(&self) -> Result<Runtime> {
        self.shared
            .runtime
            .upgrade()
            .map(Runtime::from_inner)
            .ok_or_else(|| {
                NexusError::InvalidState(format!("{}: runtime has been torn down", self.shared.id))
            })
    }

    /// Device attributes: backend-reported values merged with the matching
    /// device-database entry. Backend values win.
    pub fn get_info(&self) -> &PropertyTable {
        &self.shared.info
    }

    /// Allocate a buffer sized and tagged after `region`. No data is transferred.
    pub fn create_buffer(&self, region: &HostRegion<'_>) -> Result<Buffer> {
        self.allocate_buffer(region.byte_size(), region.dtype())
    }

    /// Allocate `byte_size` bytes tagged `dtype`, state `Unsynced`.
    pub fn allocate_buffer(&self, byte_size: u64, dtype: DataType) -> Result<Buffer> {
        validate_size(byte_size)?;
        let memory = self.shared.backend.allocate(self.shared.index, byte_size as usize)?;
        let id = BufferId::next();
        self.shared
            .queue
            .lock()
            .buffers
            .insert(id, BufferSlot { memory, state: BufferState::Unsynced });
        tracing::debug!(
            "{}: allocated {} ({} bytes, {})",
            self.shared.id,
            id,
            byte_size,
            dtype
        );
        Ok(Buffer::new(id, byte_size, dtype, &self.shared))
    }

    /// Allocate a buffer and write `region` into it.
    pub fn upload(&self, region: &HostRegion<'_>) -> Result<Buffer> {
        let buffer = self.create_buffer(region)?;
        if let Err(e) = buffer.write(*region) {
            let _ = buffer.release();
            return Err(e);
        }
        Ok(buffer)
    }

    /// Allocate a buffer on this device holding a copy of `source`, which may
    /// live on any device. The copy is staged through host memory.
    pub fn copy_buffer(&self, source: &Buffer) -> Result<Buffer> {
        let bytes = source.read_to_vec()?;
        let copy = self.upload(&HostRegion::new(&bytes, source.dtype()))?;
        tracing::debug!("{}: copied {} into {}", self.shared.id, source.id(), copy.id());
        Ok(copy)
    }

    /// Load the kernel module at `path`, or return the library already loaded
    /// from it on this device. Spellings of one file share a library.
    pub fn load_library(&self, path: impl AsRef<Path>) -> Result<Library> {
        let path = path.as_ref();
        let key = loader::source_key(path);
        let mut libraries = self.shared.libraries.lock();
        if let Some(library) = libraries.get(&key) {
            tracing::debug!("{}: library cache hit for {}", self.shared.id, path.display());
            return Ok(library.clone());
        }
        let module = self.shared.backend.load_module(self.shared.index, path)?;
        let library = Library::new(path, module, &self.shared);
        tracing::debug!("{}: loaded {} as {}", self.shared.id, path.display(), library.id());
        libraries.insert(key, library.clone());
        Ok(library)
    }

    pub fn create_schedule(&self) -> Schedule {
        let schedule = Schedule::new(&self.shared);
        tracing::debug!("{}: created {}", self.shared.id, schedule.id());
        schedule
    }

    /// Wait for the device queue to drain.
    pub fn synchronize(&self) -> Result<()> {
        let _queue = self.shared.queue.lock();
        self.shared.backend.synchronize(self.shared.index)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.shared.queue.lock().buffers.len()
    }

    pub fn library_count(&self) -> usize {
        self.shared.libraries.lock().len()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("index", &self.shared.index)
            .field("name", &self.name())
            .finish()
    }
}
