//! # nexus-kernels
//!
//! Sample kernel module for the Nexus host backend.
//!
//! Built as a `cdylib` it is a loadable module exporting `nexus_kernel_table`;
//! built as an `rlib` the same table can be registered in-process with
//! `nexus_runtime::loader::register_module`.
//!
//! All kernels operate on `f32` buffers, one element per work item. Work items
//! past the end of a buffer are ignored, so callers may round the launch
//! geometry up to a whole number of blocks.

use nexus_abi::{KernelArgs, KernelDescriptor, KernelTable, WorkItem, ARG_SCALAR, KERNEL_OK};

/// Returned when a launch binds fewer arguments than the kernel reads.
pub const ERR_MISSING_ARGS: i32 = 1;
/// Returned when a slot that takes a scalar is bound to a buffer.
pub const ERR_ARG_KIND: i32 = 2;

unsafe fn bound<'a>(
    args: *const KernelArgs,
    item: *const WorkItem,
    slots: u32,
) -> Option<(&'a KernelArgs, usize)> {
    let args = &*args;
    if args.count < slots {
        return None;
    }
    Some((args, (*item).global_id()))
}

/// `out[i] = a[i] + b[i]`
unsafe extern "C" fn add_vectors(args: *const KernelArgs, item: *const WorkItem) -> i32 {
    let Some((args, i)) = bound(args, item, 3) else { return ERR_MISSING_ARGS };
    if i < args.len::<f32>(0).min(args.len::<f32>(1)).min(args.len::<f32>(2)) {
        *args.ptr::<f32>(2).add(i) = *args.ptr::<f32>(0).add(i) + *args.ptr::<f32>(1).add(i);
    }
    KERNEL_OK
}

/// `out[i] = a[i] * b[i]`
unsafe extern "C" fn mul_vectors(args: *const KernelArgs, item: *const WorkItem) -> i32 {
    let Some((args, i)) = bound(args, item, 3) else { return ERR_MISSING_ARGS };
    if i < args.len::<f32>(0).min(args.len::<f32>(1)).min(args.len::<f32>(2)) {
        *args.ptr::<f32>(2).add(i) = *args.ptr::<f32>(0).add(i) * *args.ptr::<f32>(1).add(i);
    }
    KERNEL_OK
}

/// `dst[i] = src[i]`
unsafe extern "C" fn copy_vector(args: *const KernelArgs, item: *const WorkItem) -> i32 {
    let Some((args, i)) = bound(args, item, 2) else { return ERR_MISSING_ARGS };
    if i < args.len::<f32>(0).min(args.len::<f32>(1)) {
        *args.ptr::<f32>(1).add(i) = *args.ptr::<f32>(0).add(i);
    }
    KERNEL_OK
}

/// `x[i] += 1`
unsafe extern "C" fn increment(args: *const KernelArgs, item: *const WorkItem) -> i32 {
    let Some((args, i)) = bound(args, item, 1) else { return ERR_MISSING_ARGS };
    if i < args.len::<f32>(0) {
        *args.ptr::<f32>(0).add(i) += 1.0;
    }
    KERNEL_OK
}

/// `x[i] = i`
unsafe extern "C" fn iota(args: *const KernelArgs, item: *const WorkItem) -> i32 {
    let Some((args, i)) = bound(args, item, 1) else { return ERR_MISSING_ARGS };
    if i < args.len::<f32>(0) {
        *args.ptr::<f32>(0).add(i) = i as f32;
    }
    KERNEL_OK
}

/// `x[i] *= alpha`, with `alpha` an `f32` scalar in slot 1.
unsafe extern "C" fn scale(args: *const KernelArgs, item: *const WorkItem) -> i32 {
    let Some((args, i)) = bound(args, item, 2) else { return ERR_MISSING_ARGS };
    if args.kind(1) != ARG_SCALAR {
        return ERR_ARG_KIND;
    }
    if i < args.len::<f32>(0) {
        *args.ptr::<f32>(0).add(i) *= args.scalar::<f32>(1);
    }
    KERNEL_OK
}

static KERNELS: [KernelDescriptor; 6] = [
    KernelDescriptor { name: c"add_vectors".as_ptr(), slot_count: 3, entry: add_vectors },
    KernelDescriptor { name: c"mul_vectors".as_ptr(), slot_count: 3, entry: mul_vectors },
    KernelDescriptor { name: c"copy_vector".as_ptr(), slot_count: 2, entry: copy_vector },
    KernelDescriptor { name: c"increment".as_ptr(), slot_count: 1, entry: increment },
    KernelDescriptor { name: c"iota".as_ptr(), slot_count: 1, entry: iota },
    KernelDescriptor { name: c"scale".as_ptr(), slot_count: 2, entry: scale },
];

static TABLE: KernelTable = KernelTable::new(&KERNELS);

/// The module's kernel table, for in-process registration.
pub fn kernel_table() -> &'static KernelTable {
    &TABLE
}

/// Exported entry point resolved by the runtime's module loader.
#[no_mangle]
pub extern "C" fn nexus_kernel_table() -> *const KernelTable {
    &TABLE
}
