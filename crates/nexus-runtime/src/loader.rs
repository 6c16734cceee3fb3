//! Kernel module loading.
//!
//! Every host-side module load goes through this registry. A module is either
//! a shared library exporting `nexus_kernel_table`, or a statically linked
//! [`KernelTable`] registered under a path-like name with [`register_module`].
//! Loaded modules are cached process-wide by canonical path and stay mapped for
//! the life of the process, so kernel entry points never dangle.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use libloading::Library;
use nexus_abi::{KernelFn, KernelTable, KernelTableFn, ABI_VERSION, KERNEL_TABLE_SYMBOL};
use parking_lot::Mutex;

use crate::{NexusError, Result};

/// Opaque handle to a loaded module's symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(u64);

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// One resolved kernel entry point.
#[derive(Debug, Clone, Copy)]
pub struct KernelSymbol {
    pub slot_count: u32,
    pub entry: KernelFn,
}

/// Where a module came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleSource {
    /// Registered in-process under this name.
    Static(String),
    /// Loaded from this canonical file path.
    File(PathBuf),
}

/// A loaded module and its name → kernel symbol table.
pub struct LoadedModule {
    handle: ModuleHandle,
    source: ModuleSource,
    symbols: HashMap<String, KernelSymbol>,
    // Keeps the shared object mapped while entry points are reachable.
    _library: Option<Library>,
}

impl LoadedModule {
    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn source(&self) -> &ModuleSource {
        &self.source
    }

    pub fn symbol(&self, name: &str) -> Option<&KernelSymbol> {
        self.symbols.get(name)
    }

    /// Kernel names, sorted.
    pub fn kernel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.symbols.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("handle", &self.handle)
            .field("source", &self.source)
            .field("kernels", &self.symbols.len())
            .finish()
    }
}

#[derive(Default)]
struct ModuleRegistry {
    statics: HashMap<String, &'static KernelTable>,
    by_key: HashMap<ModuleSource, Arc<LoadedModule>>,
    by_handle: HashMap<ModuleHandle, Arc<LoadedModule>>,
}

static REGISTRY: OnceLock<Mutex<ModuleRegistry>> = OnceLock::new();
static NEXT_MODULE: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<ModuleRegistry> {
    REGISTRY.get_or_init(|| Mutex::new(ModuleRegistry::default()))
}

/// Register a statically linked kernel table under `name`.
///
/// Later loads of exactly `name` resolve to this table before the filesystem is
/// consulted. Re-registering the same table is a no-op; registering a different
/// one replaces it for subsequent loads.
pub fn register_module(name: &str, table: &'static KernelTable) -> Result<()> {
    if name.is_empty() {
        return Err(NexusError::InvalidArgument("module name is empty".into()));
    }
    // Reject malformed tables at registration rather than at first load.
    unsafe { parse_table(table, name) }?;

    let mut reg = registry().lock();
    if let Some(existing) = reg.statics.get(name) {
        if std::ptr::eq(*existing, table) {
            return Ok(());
        }
        if let Some(old) = reg.by_key.remove(&ModuleSource::Static(name.to_string())) {
            reg.by_handle.remove(&old.handle);
        }
    }
    reg.statics.insert(name.to_string(), table);
    tracing::debug!("registered static kernel module '{}'", name);
    Ok(())
}

/// Remove a static registration. Returns whether one existed.
pub fn unregister_module(name: &str) -> bool {
    let mut reg = registry().lock();
    if let Some(old) = reg.by_key.remove(&ModuleSource::Static(name.to_string())) {
        reg.by_handle.remove(&old.handle);
    }
    reg.statics.remove(name).is_some()
}

/// Resolve a module handle to its symbol table.
pub fn resolve(handle: ModuleHandle) -> Option<Arc<LoadedModule>> {
    registry().lock().by_handle.get(&handle).cloned()
}

/// The key a load of `path` is cached under: the registered name, else the
/// canonical file path. A path that does not resolve keys on itself.
pub fn source_key(path: &Path) -> ModuleSource {
    let name = path.to_string_lossy();
    if registry().lock().statics.contains_key(name.as_ref()) {
        return ModuleSource::Static(name.into_owned());
    }
    ModuleSource::File(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()))
}

/// Load (or fetch from cache) the module at `path`.
///
/// `NotFound` if `path` is neither registered nor an existing file;
/// `RuntimeFailure` if the file is not a loadable, ABI-compatible kernel module.
pub fn load(path: &Path) -> Result<Arc<LoadedModule>> {
    let name = path.to_string_lossy();
    let mut reg = registry().lock();

    if let Some(&table) = reg.statics.get(name.as_ref()) {
        let key = ModuleSource::Static(name.to_string());
        if let Some(module) = reg.by_key.get(&key) {
            return Ok(Arc::clone(module));
        }
        let symbols = unsafe { parse_table(table, &name) }?;
        return Ok(insert(&mut reg, key, symbols, None));
    }

    if !path.exists() {
        return Err(NexusError::NotFound(format!("kernel module '{}'", path.display())));
    }
    let canonical = path.canonicalize().map_err(|e| {
        NexusError::NotFound(format!("kernel module '{}': {}", path.display(), e))
    })?;
    let key = ModuleSource::File(canonical.clone());
    if let Some(module) = reg.by_key.get(&key) {
        return Ok(Arc::clone(module));
    }

    let library = unsafe { Library::new(&canonical) }.map_err(|e| {
        NexusError::RuntimeFailure(format!("failed to load module {}: {}", canonical.display(), e))
    })?;
    let table_fn: KernelTableFn = unsafe {
        *library.get::<KernelTableFn>(KERNEL_TABLE_SYMBOL).map_err(|e| {
            NexusError::RuntimeFailure(format!(
                "{} is not a kernel module (missing nexus_kernel_table): {}",
                canonical.display(),
                e
            ))
        })?
    };
    let table = unsafe { table_fn() };
    if table.is_null() {
        return Err(NexusError::RuntimeFailure(format!(
            "{}: nexus_kernel_table returned null",
            canonical.display()
        )));
    }
    let symbols = unsafe { parse_table(&*table, &canonical.to_string_lossy()) }?;
    tracing::info!("loaded kernel module {} ({} kernels)", canonical.display(), symbols.len());
    Ok(insert(&mut reg, key, symbols, Some(library)))
}

fn insert(
    reg: &mut ModuleRegistry,
    source: ModuleSource,
    symbols: HashMap<String, KernelSymbol>,
    library: Option<Library>,
) -> Arc<LoadedModule> {
    let handle = ModuleHandle(NEXT_MODULE.fetch_add(1, Ordering::Relaxed));
    let module =
        Arc::new(LoadedModule { handle, source: source.clone(), symbols, _library: library });
    reg.by_key.insert(source, Arc::clone(&module));
    reg.by_handle.insert(handle, Arc::clone(&module));
    module
}

/// Validate a kernel table and build its symbol map.
///
/// # Safety
/// `table` must point at descriptors valid for the life of the process.
unsafe fn parse_table(table: &KernelTable, module: &str) -> Result<HashMap<String, KernelSymbol>> {
    if table.abi_version != ABI_VERSION {
        return Err(NexusError::RuntimeFailure(format!(
            "module '{}' targets kernel ABI v{}, runtime expects v{}",
            module, table.abi_version, ABI_VERSION
        )));
    }
    if table.count > 0 && table.kernels.is_null() {
        return Err(NexusError::RuntimeFailure(format!("module '{module}': null kernel list")));
    }
    let mut symbols = HashMap::with_capacity(table.count as usize);
    for desc in table.descriptors() {
        if desc.name.is_null() {
            return Err(NexusError::RuntimeFailure(format!("module '{module}': unnamed kernel")));
        }
        let name = CStr::from_ptr(desc.name).to_str().map_err(|_| {
            NexusError::RuntimeFailure(format!("module '{module}': kernel name is not UTF-8"))
        })?;
        let symbol = KernelSymbol { slot_count: desc.slot_count, entry: desc.entry };
        if symbols.insert(name.to_string(), symbol).is_some() {
            return Err(NexusError::RuntimeFailure(format!(
                "module '{module}': duplicate kernel '{name}'"
            )));
        }
    }
    Ok(symbols)
}
