//! Runtime discovery.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::backend::{Backend, HostBackend, PluginBackend};
use crate::config::RegistryConfig;
use crate::properties::DeviceDatabase;
use crate::runtime::Runtime;
use crate::{NexusError, Result};

const PLUGIN_EXTENSIONS: &[&str] = &["so", "dylib", "dll"];

/// Owns the set of discovered runtimes.
///
/// Discovery runs lazily on the first [`enumerate`](Self::enumerate) and at
/// most once until [`reset`](Self::reset); concurrent first callers block on
/// the same pass instead of repeating it.
pub struct RuntimeRegistry {
    config: RegistryConfig,
    runtimes: Mutex<Option<Arc<[Runtime]>>>,
    discoveries: AtomicUsize,
}

impl RuntimeRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config, runtimes: Mutex::new(None), discoveries: AtomicUsize::new(0) }
    }

    /// Process-wide registry configured from the environment.
    pub fn global() -> &'static RuntimeRegistry {
        static GLOBAL: OnceLock<RuntimeRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| RuntimeRegistry::new(RegistryConfig::from_env()))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// All discovered runtimes: the host runtime first, then plugins in
    /// search-path and file-name order. Empty if no backend is available.
    pub fn enumerate(&self) -> Vec<Runtime> {
        let mut runtimes = self.runtimes.lock();
        let found = runtimes.get_or_insert_with(|| {
            self.discoveries.fetch_add(1, Ordering::SeqCst);
            discover(&self.config).into()
        });
        found.to_vec()
    }

    /// First runtime named `name`.
    pub fn runtime(&self, name: &str) -> Result<Runtime> {
        self.enumerate()
            .into_iter()
            .find(|r| r.name() == name)
            .ok_or_else(|| NexusError::NotFound(format!("runtime '{name}'")))
    }

    /// Number of discovery passes run so far.
    pub fn discovery_count(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }

    /// Drop the discovered runtimes; the next `enumerate` rediscovers.
    pub fn reset(&self) {
        if self.runtimes.lock().take().is_some() {
            tracing::debug!("runtime registry reset");
        }
    }
}

fn discover(config: &RegistryConfig) -> Vec<Runtime> {
    let database = DeviceDatabase::load(&config.device_db_paths);
    let mut backends = Vec::new();

    if config.host.enabled {
        match HostBackend::new(&config.host) {
            Ok(host) => backends.push(Backend::Host(host)),
            Err(e) => tracing::warn!("host runtime unavailable: {}", e),
        }
    }

    for path in plugin_candidates(&config.runtime_paths) {
        match PluginBackend::load(&path) {
            Ok(plugin) => backends.push(Backend::Plugin(plugin)),
            Err(e) => tracing::warn!("skipping plugin {}: {}", path.display(), e),
        }
    }

    let runtimes: Vec<Runtime> = backends
        .into_iter()
        .enumerate()
        .map(|(index, backend)| Runtime::new(index, backend, &database))
        .collect();
    let devices: usize = runtimes.iter().map(Runtime::device_count).sum();
    tracing::info!(
        "discovered {} runtime(s), {} device(s), {} device database entries",
        runtimes.len(),
        devices,
        database.len()
    );
    runtimes
}

/// Shared libraries in `dirs`, directory order first, then file name.
fn plugin_candidates(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("runtime path {}: {}", dir.display(), e);
                continue;
            }
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_shared_library(p))
            .collect();
        files.sort();
        found.extend(files);
    }
    found
}

fn is_shared_library(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PLUGIN_EXTENSIONS.contains(&ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeKind;

    #[test]
    fn test_shared_library_detection() {
        assert!(is_shared_library(Path::new("/a/libnexus_cuda.so")));
        assert!(is_shared_library(Path::new("nexus.dll")));
        assert!(!is_shared_library(Path::new("README.md")));
        assert!(!is_shared_library(Path::new("libfoo.so.1")));
    }

    #[test]
    fn test_candidates_sorted_per_dir() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for name in ["zeta.so", "alpha.so", "notes.txt"] {
            std::fs::write(a.path().join(name), b"").unwrap();
        }
        std::fs::write(b.path().join("beta.dylib"), b"").unwrap();

        let found = plugin_candidates(&[a.path().to_path_buf(), b.path().to_path_buf()]);
        let names: Vec<_> =
            found.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, vec!["alpha.so", "zeta.so", "beta.dylib"]);
    }

    #[test]
    fn test_broken_plugins_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("libbroken.so"), b"garbage").unwrap();
        let mut config = RegistryConfig::host_only();
        config.runtime_paths = vec![dir.path().to_path_buf()];
        let registry = RuntimeRegistry::new(config);

        let runtimes = registry.enumerate();
        assert_eq!(runtimes.len(), 1);
        assert_eq!(runtimes[0].kind(), RuntimeKind::Host);
    }

    #[test]
    fn test_no_backends_is_empty() {
        let mut config = RegistryConfig::host_only();
        config.host.enabled = false;
        let registry = RuntimeRegistry::new(config);
        assert!(registry.enumerate().is_empty());
        assert_eq!(registry.discovery_count(), 1);
        assert!(registry.enumerate().is_empty());
        assert_eq!(registry.discovery_count(), 1);
    }
}
