//! Shared helpers for the runtime integration tests.

#![allow(dead_code)]

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::PathBuf;

use nexus_runtime::loader::register_module;
use nexus_runtime::{Device, Kernel, RegistryConfig, RuntimeRegistry};

/// Name the sample kernel module is registered under.
pub const SAMPLE_KERNELS: &str = "nexus-test:sample-kernels";

/// A registry with only the host runtime, the sample kernels registered.
pub fn host_registry() -> RuntimeRegistry {
    register_module(SAMPLE_KERNELS, nexus_kernels::kernel_table())
        .expect("register sample kernels");
    let mut config = RegistryConfig::host_only();
    config.host.threads = Some(4);
    RuntimeRegistry::new(config)
}

/// The host device of a fresh registry.
pub fn host_device() -> Device {
    let registry = host_registry();
    registry.runtime("host").unwrap().device(0).unwrap()
}

pub fn sample_kernel(device: &Device, name: &str) -> Kernel {
    device.load_library(SAMPLE_KERNELS).unwrap().get_kernel(name).unwrap()
}

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!((x - y).abs() < tol, "element {} differs: {} vs {} (tol={})", i, x, y, tol);
    }
}

/// A workspace `cdylib` that cargo built for this test binary.
pub fn built_cdylib(crate_name: &str) -> PathBuf {
    let file = format!("{}{}{}", DLL_PREFIX, crate_name.replace('-', "_"), DLL_SUFFIX);
    let exe = std::env::current_exe().expect("test binary path");
    let deps = exe.parent().expect("test binary directory");
    for dir in [deps, deps.parent().unwrap_or(deps)] {
        let path = dir.join(&file);
        if path.is_file() {
            return path;
        }
    }
    panic!("{} was not built next to {}", file, exe.display());
}
