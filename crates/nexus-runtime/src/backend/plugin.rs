//! Vendor backends loaded from shared libraries at discovery time.
//!
//! A plugin exports the `nxs_*` C API from [`nexus_abi::plugin`]. Required
//! symbols are resolved once when the plugin is opened; optional ones may be
//! absent, in which case the matching operation reports `Unsupported`.

use std::ffi::{c_char, c_int, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use nexus_abi::plugin::*;
use nexus_abi::{ARG_BUFFER, ARG_SCALAR};

use super::{KernelEntry, LaunchArg};
use crate::properties::{keys, PropertyTable};
use crate::schedule::LaunchGeometry;
use crate::{NexusError, Result};

/// Capacity handed to the plugin for one property value.
const PROPERTY_CAPACITY: usize = 256;

pub(crate) struct PluginApi {
    _lib: Library,
    get_device_count: FnGetDeviceCount,
    get_runtime_property: FnGetRuntimeProperty,
    get_device_property: FnGetDeviceProperty,
    create_buffer: FnCreateBuffer,
    release_buffer: FnReleaseBuffer,
    write_buffer: FnWriteBuffer,
    read_buffer: FnReadBuffer,
    load_library: FnLoadLibrary,
    get_kernel: FnGetKernel,
    launch_kernel: FnLaunchKernel,
    synchronize: FnSynchronize,
    fill_buffer: Option<FnFillBuffer>,
    release_library: Option<FnReleaseLibrary>,
}

// The plugin contract requires every entry point to be callable from any thread.
unsafe impl Send for PluginApi {}
unsafe impl Sync for PluginApi {}

unsafe fn required<T: Copy>(lib: &Library, path: &Path, symbol: &[u8]) -> Result<T> {
    lib.get::<T>(symbol).map(|s| *s).map_err(|e| {
        let name = String::from_utf8_lossy(symbol.strip_suffix(b"\0").unwrap_or(symbol));
        NexusError::RuntimeFailure(format!("plugin {}: missing {}: {}", path.display(), name, e))
    })
}

unsafe fn optional<T: Copy>(lib: &Library, symbol: &[u8]) -> Option<T> {
    lib.get::<T>(symbol).ok().map(|s| *s)
}

impl PluginApi {
    fn open(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            NexusError::RuntimeFailure(format!("plugin {}: {}", path.display(), e))
        })?;
        unsafe {
            Ok(PluginApi {
                get_device_count: required(&lib, path, SYM_GET_DEVICE_COUNT)?,
                get_runtime_property: required(&lib, path, SYM_GET_RUNTIME_PROPERTY)?,
                get_device_property: required(&lib, path, SYM_GET_DEVICE_PROPERTY)?,
                create_buffer: required(&lib, path, SYM_CREATE_BUFFER)?,
                release_buffer: required(&lib, path, SYM_RELEASE_BUFFER)?,
                write_buffer: required(&lib, path, SYM_WRITE_BUFFER)?,
                read_buffer: required(&lib, path, SYM_READ_BUFFER)?,
                load_library: required(&lib, path, SYM_LOAD_LIBRARY)?,
                get_kernel: required(&lib, path, SYM_GET_KERNEL)?,
                launch_kernel: required(&lib, path, SYM_LAUNCH_KERNEL)?,
                synchronize: required(&lib, path, SYM_SYNCHRONIZE)?,
                fill_buffer: optional(&lib, SYM_FILL_BUFFER),
                release_library: optional(&lib, SYM_RELEASE_LIBRARY),
                _lib: lib,
            })
        }
    }
}

/// Map a plugin status onto the runtime error taxonomy.
fn check(status: NxsStatus, what: &str) -> Result<()> {
    let message = || format!("{what}: {}", status_name(status));
    match status {
        NXS_SUCCESS => Ok(()),
        NXS_INVALID_ARGUMENT => Err(NexusError::InvalidArgument(message())),
        NXS_NOT_FOUND => Err(NexusError::NotFound(message())),
        NXS_INVALID_STATE => Err(NexusError::InvalidState(message())),
        NXS_UNSUPPORTED => Err(NexusError::Unsupported(message())),
        NXS_RUNTIME_FAILURE => Err(NexusError::RuntimeFailure(message())),
        other => Err(NexusError::RuntimeFailure(format!("{what}: status {other}"))),
    }
}

fn c_string(value: &str, what: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| NexusError::InvalidArgument(format!("{what} contains a NUL byte")))
}

fn read_property(query: impl FnOnce(*mut c_char, *mut usize) -> NxsStatus) -> Option<String> {
    let mut buf = vec![0u8; PROPERTY_CAPACITY];
    let mut size = buf.len();
    if query(buf.as_mut_ptr().cast(), &mut size) != NXS_SUCCESS {
        return None;
    }
    buf.truncate(size.min(PROPERTY_CAPACITY));
    if let Some(nul) = buf.iter().position(|&b| b == 0) {
        buf.truncate(nul);
    }
    String::from_utf8(buf).ok()
}

pub(crate) struct PluginBackend {
    name: String,
    path: PathBuf,
    api: Arc<PluginApi>,
    device_count: usize,
}

impl PluginBackend {
    /// Open the plugin at `path` and query its device count.
    pub fn load(path: &Path) -> Result<Self> {
        Self::with_api(path, PluginApi::open(path)?)
    }

    fn with_api(path: &Path, api: PluginApi) -> Result<Self> {
        let api = Arc::new(api);
        let count = unsafe { (api.get_device_count)() };
        if count < 0 {
            check(count, "nxs_get_device_count")?;
        }
        let mut backend = PluginBackend {
            name: String::new(),
            path: path.to_path_buf(),
            api,
            device_count: count.max(0) as usize,
        };
        backend.name = backend
            .runtime_property(keys::NAME)
            .or_else(|| plugin_stem(path))
            .unwrap_or_else(|| "plugin".to_string());
        tracing::debug!(
            "plugin {} ({}): {} device(s)",
            backend.name,
            backend.path.display(),
            backend.device_count
        );
        Ok(backend)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_count(&self) -> usize {
        self.device_count
    }

    fn runtime_property(&self, key: &str) -> Option<String> {
        let key = CString::new(key).ok()?;
        read_property(|value, size| unsafe {
            (self.api.get_runtime_property)(key.as_ptr(), value, size)
        })
    }

    pub fn runtime_properties(&self) -> PropertyTable {
        let mut props = PropertyTable::new();
        for key in [keys::TYPE, keys::VENDOR, "version"] {
            if let Some(value) = self.runtime_property(key) {
                props.insert(key, value);
            }
        }
        props.insert(keys::NAME, self.name.as_str());
        props.insert("path", self.path.display().to_string());
        props
    }

    pub fn device_properties(&self, device: usize) -> PropertyTable {
        let mut props = PropertyTable::new();
        for &key in keys::DEVICE_KEYS {
            let Ok(ckey) = CString::new(key) else { continue };
            let value = read_property(|value, size| unsafe {
                (self.api.get_device_property)(device as c_int, ckey.as_ptr(), value, size)
            });
            if let Some(value) = value {
                props.insert(key, value);
            }
        }
        props
    }

    pub fn allocate(&self, device: usize, size: usize) -> Result<PluginMemory> {
        let mut handle: NxsHandle = 0;
        check(
            unsafe { (self.api.create_buffer)(device as c_int, size, &mut handle) },
            "nxs_create_buffer",
        )?;
        Ok(PluginMemory { handle, size, api: Arc::clone(&self.api) })
    }

    pub fn load_module(&self, device: usize, path: &Path) -> Result<PluginModule> {
        let cpath = c_string(&path.to_string_lossy(), "library path")?;
        let mut handle: NxsHandle = 0;
        check(
            unsafe { (self.api.load_library)(device as c_int, cpath.as_ptr(), &mut handle) },
            &format!("nxs_load_library({})", path.display()),
        )?;
        Ok(PluginModule { handle, api: Arc::clone(&self.api) })
    }

    pub fn launch(
        &self,
        device: usize,
        kernel: NxsHandle,
        args: &[LaunchArg],
        geometry: LaunchGeometry,
    ) -> Result<()> {
        let mut kinds = Vec::with_capacity(args.len());
        let mut handles = Vec::with_capacity(args.len());
        let mut scalars = Vec::with_capacity(args.len());
        for arg in args {
            match *arg {
                LaunchArg::Plugin(handle) => {
                    kinds.push(ARG_BUFFER);
                    handles.push(handle);
                    scalars.push(0);
                }
                LaunchArg::Scalar(cell) => {
                    kinds.push(ARG_SCALAR);
                    handles.push(0);
                    scalars.push(cell);
                }
                LaunchArg::Host { .. } => {
                    return Err(NexusError::RuntimeFailure(
                        "host buffer bound to a plugin launch".into(),
                    ))
                }
            }
        }
        check(
            unsafe {
                (self.api.launch_kernel)(
                    device as c_int,
                    kernel,
                    kinds.as_ptr(),
                    handles.as_ptr(),
                    scalars.as_ptr(),
                    handles.len() as u32,
                    geometry.grid_size,
                    geometry.block_size,
                )
            },
            "nxs_launch_kernel",
        )
    }

    pub fn synchronize(&self, device: usize) -> Result<()> {
        check(unsafe { (self.api.synchronize)(device as c_int) }, "nxs_synchronize")
    }
}

fn plugin_stem(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    Some(stem.strip_prefix("lib").unwrap_or(stem).to_string())
}

/// Buffer owned by a plugin; released when dropped.
pub(crate) struct PluginMemory {
    handle: NxsHandle,
    size: usize,
    api: Arc<PluginApi>,
}

impl PluginMemory {
    pub fn handle(&self) -> NxsHandle {
        self.handle
    }

    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        let len = src.len().min(self.size);
        check(
            unsafe { (self.api.write_buffer)(self.handle, src.as_ptr().cast(), len) },
            "nxs_write_buffer",
        )
    }

    pub fn read(&self, dst: &mut [u8]) -> Result<()> {
        let len = dst.len().min(self.size);
        check(
            unsafe { (self.api.read_buffer)(self.handle, dst.as_mut_ptr().cast(), len) },
            "nxs_read_buffer",
        )
    }

    pub fn fill(&mut self, pattern: &[u8]) -> Result<()> {
        let fill = self.api.fill_buffer.ok_or_else(|| {
            NexusError::Unsupported("plugin does not export nxs_fill_buffer".into())
        })?;
        check(
            unsafe { fill(self.handle, pattern.as_ptr().cast(), pattern.len()) },
            "nxs_fill_buffer",
        )
    }
}

impl Drop for PluginMemory {
    fn drop(&mut self) {
        let status = unsafe { (self.api.release_buffer)(self.handle) };
        if status != NXS_SUCCESS {
            tracing::warn!("nxs_release_buffer({}) failed: {}", self.handle, status_name(status));
        }
    }
}

/// Library loaded inside a plugin.
pub(crate) struct PluginModule {
    handle: NxsHandle,
    api: Arc<PluginApi>,
}

impl PluginModule {
    pub fn lookup(&self, name: &str) -> Result<(u32, KernelEntry)> {
        let cname = c_string(name, "kernel name")?;
        let mut slot_count = 0u32;
        let mut kernel: NxsHandle = 0;
        check(
            unsafe {
                (self.api.get_kernel)(self.handle, cname.as_ptr(), &mut slot_count, &mut kernel)
            },
            &format!("kernel '{name}'"),
        )?;
        Ok((slot_count, KernelEntry::Plugin(kernel)))
    }
}

impl Drop for PluginModule {
    fn drop(&mut self) {
        if let Some(release) = self.api.release_library {
            let status = unsafe { release(self.handle) };
            if status != NXS_SUCCESS {
                tracing::warn!(
                    "nxs_release_library({}) failed: {}",
                    self.handle,
                    status_name(status)
                );
            }
        }
    }
}
