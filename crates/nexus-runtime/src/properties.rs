//! String-keyed property tables and the on-disk device database.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{NexusError, Result};

/// Well-known property keys.
pub mod keys {
    pub const NAME: &str = "name";
    pub const TYPE: &str = "type";
    pub const VENDOR: &str = "vendor";
    pub const ARCHITECTURE: &str = "architecture";
    /// Device memory capacity in bytes.
    pub const MEMORY: &str = "memory";
    pub const CORES: &str = "cores";

    /// Keys queried from every backend device.
    pub const DEVICE_KEYS: &[&str] = &[NAME, TYPE, VENDOR, ARCHITECTURE, MEMORY, CORES];
}

/// Ordered string → string attribute table.
///
/// Absence of a key is not an error until a caller asks for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyTable {
    entries: BTreeMap<String, String>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Look up `key`, failing with `NotFound` when absent.
    pub fn get(&self, key: &str) -> Result<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| NexusError::NotFound(format!("property '{key}'")))
    }

    /// Look up and parse `key`.
    pub fn get_as<T: FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.get(key)?;
        raw.parse::<T>().map_err(|_| {
            NexusError::InvalidArgument(format!(
                "property '{key}' = {raw:?} is not of the requested type"
            ))
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Add every entry of `other` whose key is not already present.
    pub fn merge_missing(&mut self, other: &PropertyTable) {
        for (k, v) in &other.entries {
            self.entries.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertyTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = PropertyTable::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}

/// Static device descriptions keyed by architecture name.
///
/// Each `<architecture>.json` file in a search directory becomes one entry.
/// Nested objects flatten to `/`-joined keys, so
/// `{"coreSubsystem": {"maxPerUnit": 64}}` yields `coreSubsystem/maxPerUnit = "64"`.
#[derive(Debug, Clone, Default)]
pub struct DeviceDatabase {
    devices: HashMap<String, PropertyTable>,
}

impl DeviceDatabase {
    /// Scan `paths` for JSON files. Unreadable directories and malformed files
    /// are logged and skipped; earlier directories win on name collisions.
    pub fn load(paths: &[PathBuf]) -> Self {
        let mut db = DeviceDatabase::default();
        for dir in paths {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!("device database: skipping {}: {}", dir.display(), e);
                    continue;
                }
            };
            let mut files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            for file in files {
                let Some(arch) = file.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
                    continue;
                };
                if db.devices.contains_key(&arch) {
                    continue;
                }
                match load_device_file(&file) {
                    Ok(table) => {
                        tracing::debug!(
                            "device database: loaded '{}' ({} properties)",
                            arch,
                            table.len()
                        );
                        db.devices.insert(arch, table);
                    }
                    Err(e) => {
                        tracing::warn!("device database: failed to load {}: {}", file.display(), e)
                    }
                }
            }
        }
        db
    }

    pub fn insert(&mut self, architecture: impl Into<String>, table: PropertyTable) {
        self.devices.insert(architecture.into(), table);
    }

    /// Description for `architecture`, `NotFound` if absent.
    pub fn lookup(&self, architecture: &str) -> Result<&PropertyTable> {
        self.devices
            .get(architecture)
            .ok_or_else(|| NexusError::NotFound(format!("device database entry '{architecture}'")))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn load_device_file(path: &Path) -> Result<PropertyTable> {
    let text = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| NexusError::InvalidArgument(format!("{}: {}", path.display(), e)))?;
    let serde_json::Value::Object(map) = value else {
        return Err(NexusError::InvalidArgument(format!(
            "{}: top level is not an object",
            path.display()
        )));
    };
    let mut table = PropertyTable::new();
    for (key, value) in &map {
        flatten(key, value, &mut table);
    }
    Ok(table)
}

fn flatten(prefix: &str, value: &serde_json::Value, out: &mut PropertyTable) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, inner) in map {
                flatten(&format!("{prefix}/{key}"), inner, out);
            }
        }
        serde_json::Value::String(s) => out.insert(prefix, s.as_str()),
        serde_json::Value::Null => {}
        other => out.insert(prefix, other.to_string()),
    }
}
