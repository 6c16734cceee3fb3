//! Backend plugin ABI.
//!
//! A plugin is a shared library dropped into one of the runtime search
//! directories. It exports the C symbols below; the runtime resolves them once
//! at discovery time. All handles are opaque `u64` values owned by the plugin.

use std::ffi::{c_char, c_int, c_void};

use crate::ArgKind;

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

pub type NxsStatus = c_int;
pub const NXS_SUCCESS: NxsStatus = 0;
pub const NXS_INVALID_ARGUMENT: NxsStatus = -1;
pub const NXS_NOT_FOUND: NxsStatus = -2;
pub const NXS_INVALID_STATE: NxsStatus = -3;
pub const NXS_RUNTIME_FAILURE: NxsStatus = -4;
pub const NXS_UNSUPPORTED: NxsStatus = -5;

/// Opaque plugin-side object handle.
pub type NxsHandle = u64;

// ---------------------------------------------------------------------------
// Symbol names
// ---------------------------------------------------------------------------

pub const SYM_GET_DEVICE_COUNT: &[u8] = b"nxs_get_device_count\0";
pub const SYM_GET_RUNTIME_PROPERTY: &[u8] = b"nxs_get_runtime_property\0";
pub const SYM_GET_DEVICE_PROPERTY: &[u8] = b"nxs_get_device_property\0";
pub const SYM_CREATE_BUFFER: &[u8] = b"nxs_create_buffer\0";
pub const SYM_RELEASE_BUFFER: &[u8] = b"nxs_release_buffer\0";
pub const SYM_WRITE_BUFFER: &[u8] = b"nxs_write_buffer\0";
pub const SYM_READ_BUFFER: &[u8] = b"nxs_read_buffer\0";
pub const SYM_FILL_BUFFER: &[u8] = b"nxs_fill_buffer\0";
pub const SYM_LOAD_LIBRARY: &[u8] = b"nxs_load_library\0";
pub const SYM_RELEASE_LIBRARY: &[u8] = b"nxs_release_library\0";
pub const SYM_GET_KERNEL: &[u8] = b"nxs_get_kernel\0";
pub const SYM_LAUNCH_KERNEL: &[u8] = b"nxs_launch_kernel\0";
pub const SYM_SYNCHRONIZE: &[u8] = b"nxs_synchronize\0";

// ---------------------------------------------------------------------------
// Function signatures
// ---------------------------------------------------------------------------

/// Returns the number of devices (>= 0) or a negative status.
pub type FnGetDeviceCount = unsafe extern "C" fn() -> c_int;

/// Copy a NUL-terminated string value for `key` into `value`. On entry `*size`
/// is the capacity of `value`; on success it holds the bytes written.
pub type FnGetRuntimeProperty =
    unsafe extern "C" fn(key: *const c_char, value: *mut c_char, size: *mut usize) -> NxsStatus;
pub type FnGetDeviceProperty = unsafe extern "C" fn(
    device: c_int,
    key: *const c_char,
    value: *mut c_char,
    size: *mut usize,
) -> NxsStatus;

pub type FnCreateBuffer =
    unsafe extern "C" fn(device: c_int, size: usize, out: *mut NxsHandle) -> NxsStatus;
pub type FnReleaseBuffer = unsafe extern "C" fn(buffer: NxsHandle) -> NxsStatus;
pub type FnWriteBuffer =
    unsafe extern "C" fn(buffer: NxsHandle, src: *const c_void, size: usize) -> NxsStatus;
pub type FnReadBuffer =
    unsafe extern "C" fn(buffer: NxsHandle, dst: *mut c_void, size: usize) -> NxsStatus;
pub type FnFillBuffer = unsafe extern "C" fn(
    buffer: NxsHandle,
    pattern: *const c_void,
    pattern_size: usize,
) -> NxsStatus;

pub type FnLoadLibrary =
    unsafe extern "C" fn(device: c_int, path: *const c_char, out: *mut NxsHandle) -> NxsStatus;
pub type FnReleaseLibrary = unsafe extern "C" fn(library: NxsHandle) -> NxsStatus;
pub type FnGetKernel = unsafe extern "C" fn(
    library: NxsHandle,
    name: *const c_char,
    slot_count: *mut u32,
    out: *mut NxsHandle,
) -> NxsStatus;

/// Launch `kernel` over `count` argument slots and block until it completes.
///
/// `kinds[i]` is [`ARG_BUFFER`](crate::ARG_BUFFER), with the buffer handle in
/// `buffers[i]`, or [`ARG_SCALAR`](crate::ARG_SCALAR), with the value cell in
/// `scalars[i]`. The unused entry of each slot is zero.
pub type FnLaunchKernel = unsafe extern "C" fn(
    device: c_int,
    kernel: NxsHandle,
    kinds: *const ArgKind,
    buffers: *const NxsHandle,
    scalars: *const u64,
    count: u32,
    grid_size: u32,
    block_size: u32,
) -> NxsStatus;
pub type FnSynchronize = unsafe extern "C" fn(device: c_int) -> NxsStatus;

/// Human-readable name of a status code.
pub fn status_name(status: NxsStatus) -> &'static str {
    match status {
        NXS_SUCCESS => "success",
        NXS_INVALID_ARGUMENT => "invalid argument",
        NXS_NOT_FOUND => "not found",
        NXS_INVALID_STATE => "invalid state",
        NXS_RUNTIME_FAILURE => "runtime failure",
        NXS_UNSUPPORTED => "unsupported",
        _ => "unknown status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(status_name(NXS_SUCCESS), "success");
        assert_eq!(status_name(NXS_NOT_FOUND), "not found");
        assert_eq!(status_name(-99), "unknown status");
    }

    #[test]
    fn test_symbols_nul_terminated() {
        for sym in [SYM_GET_DEVICE_COUNT, SYM_LAUNCH_KERNEL, SYM_FILL_BUFFER] {
            assert_eq!(sym.last(), Some(&0));
        }
    }
}
