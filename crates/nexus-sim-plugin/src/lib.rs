//! # nexus-sim-plugin
//!
//! Reference backend plugin that simulates an accelerator in host memory.
//!
//! Provides:
//! - Every required `nxs_*` entry point, plus the optional `nxs_fill_buffer`
//!   and `nxs_release_library`
//! - [`DEVICE_COUNT`] devices with [`DEVICE_MEMORY`] bytes each, all reporting
//!   architecture [`ARCHITECTURE`]
//! - One library, [`BUILTIN_LIBRARY`], holding `add_vectors`, `scale` and `fail`
//! - Diagnostic exports counting live buffers and libraries, outside the plugin ABI
//!
//! Dropped into a runtime search directory as a shared library it is
//! discovered like any vendor plugin. All state lives in the loaded image, so
//! each separately loaded copy is an independent simulator.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::OnceLock;

use nexus_abi::plugin::*;
use nexus_abi::{ArgKind, ScalarArg, ARG_BUFFER, ARG_SCALAR};
use parking_lot::Mutex;

/// Path `nxs_load_library` resolves to the built-in kernels.
pub const BUILTIN_LIBRARY: &str = "sim:builtin";
pub const DEVICE_COUNT: c_int = 2;
/// Capacity of each device. Allocations past it fail.
pub const DEVICE_MEMORY: usize = 64 << 20;
pub const ARCHITECTURE: &str = "sim-arch";

pub const SYM_LIVE_BUFFERS: &[u8] = b"nxs_sim_live_buffers\0";
pub const SYM_LIVE_LIBRARIES: &[u8] = b"nxs_sim_live_libraries\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimKernel {
    /// `out[i] = a[i] + b[i]` over `f32` buffers.
    AddVectors,
    /// `x[i] *= alpha`, `alpha` an `f32` scalar.
    Scale,
    /// Always fails with `NXS_RUNTIME_FAILURE`.
    Fail,
}

impl SimKernel {
    fn by_name(name: &str) -> Option<Self> {
        match name {
            "add_vectors" => Some(SimKernel::AddVectors),
            "scale" => Some(SimKernel::Scale),
            "fail" => Some(SimKernel::Fail),
            _ => None,
        }
    }

    fn slot_count(self) -> u32 {
        match self {
            SimKernel::AddVectors => 3,
            SimKernel::Scale => 2,
            SimKernel::Fail => 1,
        }
    }
}

struct SimBuffer {
    device: c_int,
    data: Vec<u8>,
}

#[derive(Default)]
struct SimState {
    last_handle: NxsHandle,
    buffers: HashMap<NxsHandle, SimBuffer>,
    libraries: HashMap<NxsHandle, c_int>,
    kernels: HashMap<NxsHandle, SimKernel>,
}

impl SimState {
    fn next_handle(&mut self) -> NxsHandle {
        self.last_handle += 1;
        self.last_handle
    }

    fn used_memory(&self, device: c_int) -> usize {
        self.buffers.values().filter(|b| b.device == device).map(|b| b.data.len()).sum()
    }

    fn buffer_mut(&mut self, device: c_int, handle: NxsHandle) -> Result<&mut Vec<u8>, NxsStatus> {
        match self.buffers.get_mut(&handle) {
            Some(buffer) if buffer.device == device => Ok(&mut buffer.data),
            Some(_) => Err(NXS_INVALID_ARGUMENT),
            None => Err(NXS_INVALID_STATE),
        }
    }

    fn f32s(&mut self, device: c_int, handle: NxsHandle) -> Result<Vec<f32>, NxsStatus> {
        let data = self.buffer_mut(device, handle)?;
        Ok(data.chunks_exact(4).map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])).collect())
    }
}

fn state() -> &'static Mutex<SimState> {
    static STATE: OnceLock<Mutex<SimState>> = OnceLock::new();
    STATE.get_or_init(|| Mutex::new(SimState::default()))
}

fn valid_device(device: c_int) -> bool {
    (0..DEVICE_COUNT).contains(&device)
}

fn put_f32(data: &mut [u8], index: usize, value: f32) {
    data[index * 4..index * 4 + 4].copy_from_slice(&value.to_ne_bytes());
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Copy `text` plus a NUL into a caller buffer of `*size` bytes.
unsafe fn write_value(text: &str, value: *mut c_char, size: *mut usize) -> NxsStatus {
    if value.is_null() || size.is_null() {
        return NXS_INVALID_ARGUMENT;
    }
    let bytes = text.as_bytes();
    if bytes.len() >= *size {
        return NXS_INVALID_ARGUMENT;
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), value.cast::<u8>(), bytes.len());
    *value.add(bytes.len()) = 0;
    *size = bytes.len();
    NXS_SUCCESS
}

fn runtime_property(key: &str) -> Option<String> {
    let value = match key {
        "name" => "sim",
        "type" => "simulator",
        "vendor" => "nexus",
        "version" => env!("CARGO_PKG_VERSION"),
        _ => return None,
    };
    Some(value.to_string())
}

fn device_property(device: c_int, key: &str) -> Option<String> {
    match key {
        "name" => Some(format!("sim-{device}")),
        "type" => Some("gpu".to_string()),
        "vendor" => Some("nexus".to_string()),
        "architecture" => Some(ARCHITECTURE.to_string()),
        "memory" => Some(DEVICE_MEMORY.to_string()),
        "cores" => Some("8".to_string()),
        _ => None,
    }
}

/// Argument slots of one launch.
struct Slots<'a> {
    kinds: &'a [ArgKind],
    buffers: &'a [NxsHandle],
    scalars: &'a [u64],
}

impl Slots<'_> {
    fn buffer(&self, slot: usize) -> Result<NxsHandle, NxsStatus> {
        match self.kinds.get(slot) {
            Some(&ARG_BUFFER) => Ok(self.buffers[slot]),
            _ => Err(NXS_INVALID_ARGUMENT),
        }
    }

    fn scalar<T: ScalarArg>(&self, slot: usize) -> Result<T, NxsStatus> {
        match self.kinds.get(slot) {
            Some(&ARG_SCALAR) => Ok(T::from_cell(self.scalars[slot])),
            _ => Err(NXS_INVALID_ARGUMENT),
        }
    }
}

fn run_kernel(
    state: &mut SimState,
    device: c_int,
    kernel: SimKernel,
    slots: &Slots<'_>,
    items: usize,
) -> Result<(), NxsStatus> {
    match kernel {
        SimKernel::Fail => Err(NXS_RUNTIME_FAILURE),
        SimKernel::AddVectors => {
            let a = state.f32s(device, slots.buffer(0)?)?;
            let b = state.f32s(device, slots.buffer(1)?)?;
            let out = state.buffer_mut(device, slots.buffer(2)?)?;
            let n = items.min(a.len()).min(b.len()).min(out.len() / 4);
            for i in 0..n {
                put_f32(out, i, a[i] + b[i]);
            }
            Ok(())
        }
        SimKernel::Scale => {
            let alpha = slots.scalar::<f32>(1)?;
            let handle = slots.buffer(0)?;
            let x = state.f32s(device, handle)?;
            let out = state.buffer_mut(device, handle)?;
            for (i, v) in x.iter().take(items).enumerate() {
                put_f32(out, i, v * alpha);
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Plugin ABI
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn nxs_get_device_count() -> c_int {
    DEVICE_COUNT
}

/// # Safety
/// `key` is NUL-terminated; `value` holds `*size` bytes.
#[no_mangle]
pub unsafe extern "C" fn nxs_get_runtime_property(
    key: *const c_char,
    value: *mut c_char,
    size: *mut usize,
) -> NxsStatus {
    let Some(key) = c_str(key) else { return NXS_INVALID_ARGUMENT };
    match runtime_property(key) {
        Some(text) => write_value(&text, value, size),
        None => NXS_NOT_FOUND,
    }
}

/// # Safety
/// As [`nxs_get_runtime_property`].
#[no_mangle]
pub unsafe extern "C" fn nxs_get_device_property(
    device: c_int,
    key: *const c_char,
    value: *mut c_char,
    size: *mut usize,
) -> NxsStatus {
    if !valid_device(device) {
        return NXS_INVALID_ARGUMENT;
    }
    let Some(key) = c_str(key) else { return NXS_INVALID_ARGUMENT };
    match device_property(device, key) {
        Some(text) => write_value(&text, value, size),
        None => NXS_NOT_FOUND,
    }
}

/// # Safety
/// `out` is writable.
#[no_mangle]
pub unsafe extern "C" fn nxs_create_buffer(
    device: c_int,
    size: usize,
    out: *mut NxsHandle,
) -> NxsStatus {
    if !valid_device(device) || size == 0 || out.is_null() {
        return NXS_INVALID_ARGUMENT;
    }
    let mut state = state().lock();
    if state.used_memory(device).saturating_add(size) > DEVICE_MEMORY {
        return NXS_RUNTIME_FAILURE;
    }
    let handle = state.next_handle();
    state.buffers.insert(handle, SimBuffer { device, data: vec![0; size] });
    *out = handle;
    NXS_SUCCESS
}

#[no_mangle]
pub extern "C" fn nxs_release_buffer(buffer: NxsHandle) -> NxsStatus {
    match state().lock().buffers.remove(&buffer) {
        Some(_) => NXS_SUCCESS,
        None => NXS_INVALID_STATE,
    }
}

/// # Safety
/// `src` holds `size` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn nxs_write_buffer(
    buffer: NxsHandle,
    src: *const c_void,
    size: usize,
) -> NxsStatus {
    if src.is_null() {
        return NXS_INVALID_ARGUMENT;
    }
    let mut state = state().lock();
    let Some(buffer) = state.buffers.get_mut(&buffer) else { return NXS_INVALID_STATE };
    if size > buffer.data.len() {
        return NXS_INVALID_ARGUMENT;
    }
    std::ptr::copy_nonoverlapping(src.cast::<u8>(), buffer.data.as_mut_ptr(), size);
    NXS_SUCCESS
}

/// # Safety
/// `dst` holds `size` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn nxs_read_buffer(
    buffer: NxsHandle,
    dst: *mut c_void,
    size: usize,
) -> NxsStatus {
    if dst.is_null() {
        return NXS_INVALID_ARGUMENT;
    }
    let state = state().lock();
    let Some(buffer) = state.buffers.get(&buffer) else { return NXS_INVALID_STATE };
    if size > buffer.data.len() {
        return NXS_INVALID_ARGUMENT;
    }
    std::ptr::copy_nonoverlapping(buffer.data.as_ptr(), dst.cast::<u8>(), size);
    NXS_SUCCESS
}

/// # Safety
/// `pattern` holds `pattern_size` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn nxs_fill_buffer(
    buffer: NxsHandle,
    pattern: *const c_void,
    pattern_size: usize,
) -> NxsStatus {
    if pattern.is_null() || pattern_size == 0 {
        return NXS_INVALID_ARGUMENT;
    }
    let pattern = std::slice::from_raw_parts(pattern.cast::<u8>(), pattern_size);
    let mut state = state().lock();
    let Some(buffer) = state.buffers.get_mut(&buffer) else { return NXS_INVALID_STATE };
    if buffer.data.len() % pattern_size != 0 {
        return NXS_INVALID_ARGUMENT;
    }
    for chunk in buffer.data.chunks_exact_mut(pattern_size) {
        chunk.copy_from_slice(pattern);
    }
    NXS_SUCCESS
}

/// # Safety
/// `path` is NUL-terminated; `out` is writable.
#[no_mangle]
pub unsafe extern "C" fn nxs_load_library(
    device: c_int,
    path: *const c_char,
    out: *mut NxsHandle,
) -> NxsStatus {
    if !valid_device(device) || out.is_null() {
        return NXS_INVALID_ARGUMENT;
    }
    if c_str(path) != Some(BUILTIN_LIBRARY) {
        return NXS_NOT_FOUND;
    }
    let mut state = state().lock();
    let handle = state.next_handle();
    state.libraries.insert(handle, device);
    *out = handle;
    NXS_SUCCESS
}

#[no_mangle]
pub extern "C" fn nxs_release_library(library: NxsHandle) -> NxsStatus {
    match state().lock().libraries.remove(&library) {
        Some(_) => NXS_SUCCESS,
        None => NXS_INVALID_STATE,
    }
}

/// # Safety
/// `name` is NUL-terminated; `slot_count` and `out` are writable.
#[no_mangle]
pub unsafe extern "C" fn nxs_get_kernel(
    library: NxsHandle,
    name: *const c_char,
    slot_count: *mut u32,
    out: *mut NxsHandle,
) -> NxsStatus {
    if slot_count.is_null() || out.is_null() {
        return NXS_INVALID_ARGUMENT;
    }
    let mut state = state().lock();
    if !state.libraries.contains_key(&library) {
        return NXS_INVALID_STATE;
    }
    let Some(kernel) = c_str(name).and_then(SimKernel::by_name) else { return NXS_NOT_FOUND };
    let handle = state.next_handle();
    state.kernels.insert(handle, kernel);
    *slot_count = kernel.slot_count();
    *out = handle;
    NXS_SUCCESS
}

/// # Safety
/// `kinds`, `buffers` and `scalars` each hold `count` entries.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn nxs_launch_kernel(
    device: c_int,
    kernel: NxsHandle,
    kinds: *const ArgKind,
    buffers: *const NxsHandle,
    scalars: *const u64,
    count: u32,
    grid_size: u32,
    block_size: u32,
) -> NxsStatus {
    if !valid_device(device) {
        return NXS_INVALID_ARGUMENT;
    }
    let mut state = state().lock();
    let Some(&kernel) = state.kernels.get(&kernel) else { return NXS_INVALID_ARGUMENT };
    if count < kernel.slot_count() || kinds.is_null() || buffers.is_null() || scalars.is_null() {
        return NXS_INVALID_ARGUMENT;
    }
    let count = count as usize;
    let slots = Slots {
        kinds: std::slice::from_raw_parts(kinds, count),
        buffers: std::slice::from_raw_parts(buffers, count),
        scalars: std::slice::from_raw_parts(scalars, count),
    };
    let items = grid_size as usize * block_size as usize;
    match run_kernel(&mut state, device, kernel, &slots, items) {
        Ok(()) => NXS_SUCCESS,
        Err(status) => status,
    }
}

#[no_mangle]
pub extern "C" fn nxs_synchronize(device: c_int) -> NxsStatus {
    if valid_device(device) {
        NXS_SUCCESS
    } else {
        NXS_INVALID_ARGUMENT
    }
}

// Exports must keep the exact plugin ABI signatures.
const _: FnGetDeviceCount = nxs_get_device_count;
const _: FnGetRuntimeProperty = nxs_get_runtime_property;
const _: FnGetDeviceProperty = nxs_get_device_property;
const _: FnCreateBuffer = nxs_create_buffer;
const _: FnReleaseBuffer = nxs_release_buffer;
const _: FnWriteBuffer = nxs_write_buffer;
const _: FnReadBuffer = nxs_read_buffer;
const _: FnFillBuffer = nxs_fill_buffer;
const _: FnLoadLibrary = nxs_load_library;
const _: FnReleaseLibrary = nxs_release_library;
const _: FnGetKernel = nxs_get_kernel;
const _: FnLaunchKernel = nxs_launch_kernel;
const _: FnSynchronize = nxs_synchronize;

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Buffers created and not yet released.
#[no_mangle]
pub extern "C" fn nxs_sim_live_buffers() -> u64 {
    state().lock().buffers.len() as u64
}

/// Libraries loaded and not yet released.
#[no_mangle]
pub extern "C" fn nxs_sim_live_libraries() -> u64 {
    state().lock().libraries.len() as u64
}
