//! Discovery configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Colon- (or semicolon-, on Windows) separated directories scanned for backend plugins.
pub const RUNTIME_PATH_ENV: &str = "NEXUS_RUNTIME_PATH";
/// Directories scanned for device database JSON files.
pub const DEVICE_PATH_ENV: &str = "NEXUS_DEVICE_PATH";
/// Set to `0` or `false` to skip the built-in host runtime.
pub const HOST_RUNTIME_ENV: &str = "NEXUS_HOST_RUNTIME";
/// Worker thread count for the host runtime.
pub const HOST_THREADS_ENV: &str = "NEXUS_HOST_THREADS";

const DEFAULT_RUNTIME_DIR: &str = "./runtime_libs";
const DEFAULT_DEVICE_DIR: &str = "./device_lib";

/// Built-in host backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub enabled: bool,
    /// Worker threads; `None` uses the available parallelism.
    pub threads: Option<usize>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { enabled: true, threads: None }
    }
}

/// Where and what the registry discovers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directories searched for backend plugin libraries, in order.
    pub runtime_paths: Vec<PathBuf>,
    /// Directories searched for `<architecture>.json` device descriptions.
    pub device_db_paths: Vec<PathBuf>,
    pub host: HostConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            runtime_paths: vec![PathBuf::from(DEFAULT_RUNTIME_DIR)],
            device_db_paths: vec![PathBuf::from(DEFAULT_DEVICE_DIR)],
            host: HostConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Host runtime only: no plugin or device database directories.
    pub fn host_only() -> Self {
        Self { runtime_paths: Vec::new(), device_db_paths: Vec::new(), host: HostConfig::default() }
    }

    /// Build from the `NEXUS_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            crate::NexusError::InvalidArgument(format!("config {}: {}", path.display(), e))
        })
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(paths) = lookup(RUNTIME_PATH_ENV) {
            config.runtime_paths = split_paths(&paths);
        }
        if let Some(paths) = lookup(DEVICE_PATH_ENV) {
            config.device_db_paths = split_paths(&paths);
        }
        if let Some(flag) = lookup(HOST_RUNTIME_ENV) {
            let flag = flag.trim().to_ascii_lowercase();
            config.host.enabled = !matches!(flag.as_str(), "0" | "false" | "off");
        }
        if let Some(threads) = lookup(HOST_THREADS_ENV) {
            match threads.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.host.threads = Some(n),
                _ => tracing::warn!(
                    "ignoring {}={:?}: not a positive integer",
                    HOST_THREADS_ENV,
                    threads
                ),
            }
        }
        config
    }
}

fn split_paths(value: &str) -> Vec<PathBuf> {
    std::env::split_paths(value).filter(|p| !p.as_os_str().is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::from_lookup(lookup(&[]));
        assert_eq!(config, RegistryConfig::default());
        assert!(config.host.enabled);
        assert_eq!(config.runtime_paths, vec![PathBuf::from("./runtime_libs")]);
    }

    #[test]
    fn test_env_overrides() {
        let sep = if cfg!(windows) { ";" } else { ":" };
        let paths = format!("/opt/a{sep}/opt/b");
        let config = RegistryConfig::from_lookup(lookup(&[
            (RUNTIME_PATH_ENV, paths.as_str()),
            (HOST_RUNTIME_ENV, "false"),
            (HOST_THREADS_ENV, "3"),
        ]));
        assert_eq!(config.runtime_paths, vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]);
        assert!(!config.host.enabled);
        assert_eq!(config.host.threads, Some(3));
    }

    #[test]
    fn test_bad_thread_count_ignored() {
        let config = RegistryConfig::from_lookup(lookup(&[(HOST_THREADS_ENV, "zero")]));
        assert_eq!(config.host.threads, None);
    }

    #[test]
    fn test_json_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nexus.json");
        let json = r#"{ "runtime_paths": ["/plugins"], "host": { "threads": 2 } }"#;
        std::fs::write(&path, json).unwrap();
        let config = RegistryConfig::from_json_file(&path).unwrap();
        assert_eq!(config.runtime_paths, vec![PathBuf::from("/plugins")]);
        assert_eq!(config.device_db_paths, vec![PathBuf::from("./device_lib")]);
        assert!(config.host.enabled);
        assert_eq!(config.host.threads, Some(2));
    }
}
