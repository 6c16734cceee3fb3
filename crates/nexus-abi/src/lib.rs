//! # nexus-abi
//!
//! `#[repr(C)]` contracts shared between the Nexus runtime and the native code
//! it loads at run time.
//!
//! Provides:
//! - The kernel module ABI: a module exports [`KERNEL_TABLE_SYMBOL`] returning a
//!   [`KernelTable`] that lists every entry point and its argument slot count
//! - The per-launch argument block ([`KernelArgs`]) and work-item coordinates
//!   ([`WorkItem`]) handed to each kernel invocation
//! - Scalar argument cells ([`ScalarArg`]): by-value arguments packed into the
//!   low-address bytes of a `u64`
//! - The backend plugin ABI ([`plugin`]): status codes, symbol names and
//!   function signatures a vendor runtime plugin must export

pub mod plugin;

use std::ffi::{c_char, CStr};

/// Version of the kernel table layout. Modules built against a different
/// version are rejected at load time.
pub const ABI_VERSION: u32 = 1;

/// Symbol every kernel module exports (`extern "C" fn() -> *const KernelTable`).
pub const KERNEL_TABLE_SYMBOL: &[u8] = b"nexus_kernel_table\0";

/// Kernel return value for a successful invocation. Anything else fails the command.
pub const KERNEL_OK: i32 = 0;

/// Kernel entry point. Invoked once per work item.
pub type KernelFn = unsafe extern "C" fn(args: *const KernelArgs, item: *const WorkItem) -> i32;

/// Signature of the exported [`KERNEL_TABLE_SYMBOL`] function.
pub type KernelTableFn = unsafe extern "C" fn() -> *const KernelTable;

/// What an argument slot holds.
pub type ArgKind = u32;
/// Slot bound to device memory.
pub const ARG_BUFFER: ArgKind = 0;
/// Slot bound to a by-value scalar.
pub const ARG_SCALAR: ArgKind = 1;

/// One named entry point in a kernel module.
#[repr(C)]
pub struct KernelDescriptor {
    /// NUL-terminated entry point name.
    pub name: *const c_char,
    /// Number of argument slots the kernel expects, indexed `0..slot_count`.
    pub slot_count: u32,
    pub entry: KernelFn,
}

/// The table a kernel module exposes.
#[repr(C)]
pub struct KernelTable {
    pub abi_version: u32,
    pub count: u32,
    pub kernels: *const KernelDescriptor,
}

// Tables and descriptors only point at `'static` data inside the module image.
unsafe impl Sync for KernelDescriptor {}
unsafe impl Send for KernelDescriptor {}
unsafe impl Sync for KernelTable {}
unsafe impl Send for KernelTable {}

impl KernelDescriptor {
    /// Entry point name.
    ///
    /// # Safety
    /// `name` must point at a valid NUL-terminated string.
    pub unsafe fn name(&self) -> &CStr {
        CStr::from_ptr(self.name)
    }
}

impl KernelTable {
    /// Build a table over a static descriptor array.
    pub const fn new(kernels: &'static [KernelDescriptor]) -> Self {
        Self {
            abi_version: ABI_VERSION,
            count: kernels.len() as u32,
            kernels: kernels.as_ptr(),
        }
    }

    /// View the descriptors as a slice.
    ///
    /// # Safety
    /// `kernels` must point at `count` valid descriptors.
    pub unsafe fn descriptors(&self) -> &[KernelDescriptor] {
        if self.kernels.is_null() || self.count == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.kernels, self.count as usize)
    }
}

/// Arguments bound to a launch, `count` slots.
///
/// A buffer slot `i` has `buffers[i]` pointing at `sizes[i]` bytes. A scalar
/// slot has a null buffer pointer, size zero, and its value in `scalars[i]`.
/// `kinds[i]` tells the two apart.
#[repr(C)]
pub struct KernelArgs {
    pub buffers: *const *mut u8,
    pub sizes: *const usize,
    pub kinds: *const ArgKind,
    pub scalars: *const u64,
    pub count: u32,
}

impl KernelArgs {
    /// Raw typed pointer to the buffer bound at `slot`.
    ///
    /// # Safety
    /// `slot` must be `< count`. Concurrent work items may alias the same
    /// buffer, so kernels write through the raw pointer, not through `&mut`.
    pub unsafe fn ptr<T>(&self, slot: usize) -> *mut T {
        *self.buffers.add(slot) as *mut T
    }

    /// Number of whole `T` elements in the buffer bound at `slot`. Zero for
    /// scalar slots.
    ///
    /// # Safety
    /// `slot` must be `< count`.
    pub unsafe fn len<T>(&self, slot: usize) -> usize {
        *self.sizes.add(slot) / std::mem::size_of::<T>().max(1)
    }

    /// # Safety
    /// `slot` must be `< count`.
    pub unsafe fn kind(&self, slot: usize) -> ArgKind {
        *self.kinds.add(slot)
    }

    /// The scalar bound at `slot`, read as `T`.
    ///
    /// # Safety
    /// `slot` must be `< count`.
    pub unsafe fn scalar<T: ScalarArg>(&self, slot: usize) -> T {
        T::from_cell(*self.scalars.add(slot))
    }
}

/// Numeric types that travel by value in a `u64` argument cell.
///
/// The value's native-endian bytes occupy the low addresses of the cell; the
/// rest is zero.
pub trait ScalarArg: Copy {
    fn to_cell(self) -> u64;
    fn from_cell(cell: u64) -> Self;
}

macro_rules! scalar_arg {
    ($($t:ty),* $(,)?) => {
        $(impl ScalarArg for $t {
            fn to_cell(self) -> u64 {
                const N: usize = std::mem::size_of::<$t>();
                let mut cell = [0u8; 8];
                cell[..N].copy_from_slice(&self.to_ne_bytes());
                u64::from_ne_bytes(cell)
            }

            fn from_cell(cell: u64) -> Self {
                const N: usize = std::mem::size_of::<$t>();
                let mut raw = [0u8; N];
                raw.copy_from_slice(&cell.to_ne_bytes()[..N]);
                <$t>::from_ne_bytes(raw)
            }
        })*
    };
}

scalar_arg!(i32, u32, i64, u64, f32, f64);

/// Coordinates of one work item inside a launch.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub group_id: u32,
    pub local_id: u32,
    pub grid_size: u32,
    pub block_size: u32,
}

impl WorkItem {
    /// Flat index of this work item across the whole launch.
    pub fn global_id(&self) -> usize {
        self.group_id as usize * self.block_size as usize + self.local_id as usize
    }

    /// Total number of work items in the launch.
    pub fn global_size(&self) -> usize {
        self.grid_size as usize * self.block_size as usize
    }
}
