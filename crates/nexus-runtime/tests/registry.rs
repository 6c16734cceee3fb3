//! Runtime discovery and registry lifecycle.

mod common;

use std::sync::Arc;

use common::host_registry;
use nexus_runtime::{ErrorKind, HostRegion, RegistryConfig, RuntimeKind, RuntimeRegistry};

#[test]
fn test_host_runtime_discovered_first() {
    let registry = host_registry();
    let runtimes = registry.enumerate();
    assert_eq!(runtimes.len(), 1);

    let host = &runtimes[0];
    assert_eq!(host.index(), 0);
    assert_eq!(host.name(), "host");
    assert_eq!(host.kind(), RuntimeKind::Host);
    assert_eq!(host.properties().get("threads").unwrap(), "4");
    assert_eq!(host.devices().len(), 1);
    assert_eq!(host.device(0).unwrap().index(), 0);
    assert_eq!(host.device(1).unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_runtime_lookup_by_name() {
    let registry = host_registry();
    assert!(registry.runtime("host").is_ok());
    assert_eq!(registry.runtime("cuda").unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_enumerate_is_stable() {
    let registry = host_registry();
    let first = registry.enumerate();
    let second = registry.enumerate();
    assert_eq!(first.len(), second.len());
    assert_eq!(first[0].device(0).unwrap().id(), second[0].device(0).unwrap().id());
    assert_eq!(registry.discovery_count(), 1);
}

#[test]
fn test_concurrent_first_enumerate_discovers_once() {
    let registry = Arc::new(host_registry());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.enumerate()[0].device(0).unwrap().id())
        })
        .collect();
    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(registry.discovery_count(), 1);
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_reset_rediscovers() {
    let registry = host_registry();
    let before = registry.runtime("host").unwrap().device(0).unwrap().id();
    registry.reset();
    let after = registry.runtime("host").unwrap().device(0).unwrap().id();
    assert_ne!(before, after);
    assert_eq!(registry.discovery_count(), 2);
}

#[test]
fn test_device_runtime_backref() {
    let registry = host_registry();
    let device = registry.runtime("host").unwrap().device(0).unwrap();
    assert_eq!(device.runtime().unwrap().name(), "host");

    registry.reset();
    // The device handle keeps the device alive, but not its runtime.
    assert_eq!(device.runtime().unwrap_err().kind(), ErrorKind::InvalidState);
    let buffer = device.upload(&HostRegion::of(&[1i32, -2])).unwrap();
    assert_eq!(buffer.to_vec::<i32>().unwrap(), vec![1, -2]);
}

#[test]
fn test_disabled_host_yields_empty_list() {
    let mut config = RegistryConfig::host_only();
    config.host.enabled = false;
    let registry = RuntimeRegistry::new(config);
    assert!(registry.enumerate().is_empty());
}

#[test]
fn test_missing_plugin_dir_is_not_fatal() {
    let mut config = RegistryConfig::host_only();
    config.runtime_paths = vec!["/nonexistent/nexus/runtime_libs".into()];
    let registry = RuntimeRegistry::new(config);
    assert_eq!(registry.enumerate().len(), 1);
}
