//! Backend dispatch.
//!
//! The set of backends is closed and fixed at discovery: the built-in host
//! backend, or a vendor plugin loaded from a shared library. Device memory,
//! loaded modules and kernel entry points are tagged the same way so a value
//! can only be handed back to the backend that produced it.

mod host;
mod plugin;

use std::path::Path;
use std::sync::Arc;

use nexus_abi::plugin::NxsHandle;
use nexus_abi::KernelFn;

pub(crate) use host::{HostBackend, HostMemory};
pub(crate) use plugin::{PluginBackend, PluginMemory, PluginModule};

use crate::loader::LoadedModule;
use crate::properties::PropertyTable;
use crate::schedule::LaunchGeometry;
use crate::{NexusError, Result};

/// Which kind of backend a runtime wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    /// Built-in CPU backend.
    Host,
    /// Shared-library plugin found on the runtime search path.
    Plugin,
}

pub(crate) enum Backend {
    Host(HostBackend),
    Plugin(PluginBackend),
}

/// Backing storage of one buffer.
pub(crate) enum DeviceMemory {
    Host(HostMemory),
    Plugin(PluginMemory),
}

/// A module loaded for one device.
pub(crate) enum ModuleRef {
    Host(Arc<LoadedModule>),
    Plugin(PluginModule),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum KernelEntry {
    Host(KernelFn),
    Plugin(NxsHandle),
}

/// One bound argument slot as seen by a launch.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LaunchArg {
    Host { ptr: *mut u8, len: usize },
    Plugin(NxsHandle),
    /// Value cell of a scalar slot, valid on every backend.
    Scalar(u64),
}

fn mismatch(what: &str) -> NexusError {
    NexusError::RuntimeFailure(format!("{what} belongs to a different backend"))
}

impl Backend {
    pub fn kind(&self) -> RuntimeKind {
        match self {
            Backend::Host(_) => RuntimeKind::Host,
            Backend::Plugin(_) => RuntimeKind::Plugin,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Backend::Host(b) => b.name(),
            Backend::Plugin(b) => b.name(),
        }
    }

    pub fn runtime_properties(&self) -> PropertyTable {
        match self {
            Backend::Host(b) => b.runtime_properties(),
            Backend::Plugin(b) => b.runtime_properties(),
        }
    }

    pub fn device_count(&self) -> usize {
        match self {
            Backend::Host(_) => 1,
            Backend::Plugin(b) => b.device_count(),
        }
    }

    pub fn device_properties(&self, device: usize) -> PropertyTable {
        match self {
            Backend::Host(b) => b.device_properties(),
            Backend::Plugin(b) => b.device_properties(device),
        }
    }

    pub fn allocate(&self, device: usize, size: usize) -> Result<DeviceMemory> {
        match self {
            Backend::Host(_) => HostMemory::zeroed(size).map(DeviceMemory::Host),
            Backend::Plugin(b) => b.allocate(device, size).map(DeviceMemory::Plugin),
        }
    }

    pub fn write(&self, memory: &mut DeviceMemory, src: &[u8]) -> Result<()> {
        match (self, memory) {
            (Backend::Host(_), DeviceMemory::Host(m)) => {
                m.as_bytes_mut().copy_from_slice(src);
                Ok(())
            }
            (Backend::Plugin(_), DeviceMemory::Plugin(m)) => m.write(src),
            _ => Err(mismatch("buffer")),
        }
    }

    /// Blocking device → host read. Plugins synchronize the device first.
    pub fn read(&self, device: usize, memory: &DeviceMemory, dst: &mut [u8]) -> Result<()> {
        match (self, memory) {
            (Backend::Host(_), DeviceMemory::Host(m)) => {
                dst.copy_from_slice(m.as_bytes());
                Ok(())
            }
            (Backend::Plugin(b), DeviceMemory::Plugin(m)) => {
                b.synchronize(device)?;
                m.read(dst)
            }
            _ => Err(mismatch("buffer")),
        }
    }

    /// Repeat `pattern` over the whole allocation. `pattern` is non-empty and
    /// divides the allocation size.
    pub fn fill(&self, memory: &mut DeviceMemory, pattern: &[u8]) -> Result<()> {
        match (self, memory) {
            (Backend::Host(_), DeviceMemory::Host(m)) => {
                for chunk in m.as_bytes_mut().chunks_exact_mut(pattern.len()) {
                    chunk.copy_from_slice(pattern);
                }
                Ok(())
            }
            (Backend::Plugin(_), DeviceMemory::Plugin(m)) => m.fill(pattern),
            _ => Err(mismatch("buffer")),
        }
    }

    pub fn load_module(&self, device: usize, path: &Path) -> Result<ModuleRef> {
        match self {
            Backend::Host(_) => crate::loader::load(path).map(ModuleRef::Host),
            Backend::Plugin(b) => b.load_module(device, path).map(ModuleRef::Plugin),
        }
    }

    /// Run `entry` over the whole launch geometry and block until it completes.
    pub fn launch(
        &self,
        device: usize,
        entry: KernelEntry,
        args: &[LaunchArg],
        geometry: LaunchGeometry,
    ) -> Result<()> {
        match (self, entry) {
            (Backend::Host(b), KernelEntry::Host(f)) => b.launch(f, args, geometry),
            (Backend::Plugin(b), KernelEntry::Plugin(k)) => b.launch(device, k, args, geometry),
            _ => Err(mismatch("kernel")),
        }
    }

    pub fn synchronize(&self, device: usize) -> Result<()> {
        match self {
            Backend::Host(_) => Ok(()),
            Backend::Plugin(b) => b.synchronize(device),
        }
    }
}

impl DeviceMemory {
    pub fn launch_arg(&mut self) -> LaunchArg {
        match self {
            // No slice is formed here: one buffer may be bound to several
            // slots of the same launch.
            DeviceMemory::Host(m) => LaunchArg::Host { ptr: m.as_mut_ptr(), len: m.len() },
            DeviceMemory::Plugin(m) => LaunchArg::Plugin(m.handle()),
        }
    }
}

impl ModuleRef {
    /// Resolve `name` to its slot count and entry point.
    pub fn lookup(&self, name: &str) -> Result<(u32, KernelEntry)> {
        match self {
            ModuleRef::Host(module) => module
                .symbol(name)
                .map(|s| (s.slot_count, KernelEntry::Host(s.entry)))
                .ok_or_else(|| NexusError::NotFound(format!("kernel '{name}'"))),
            ModuleRef::Plugin(module) => module.lookup(name),
        }
    }

    /// All kernel names, when the module can enumerate them.
    pub fn kernel_names(&self) -> Option<Vec<String>> {
        match self {
            ModuleRef::Host(module) => Some(module.kernel_names()),
            ModuleRef::Plugin(_) => None,
        }
    }
}
