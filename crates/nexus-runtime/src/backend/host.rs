//! Built-in CPU backend.
//!
//! Kernels are native entry points called once per work item. Work-groups of a
//! launch run in parallel on a dedicated rayon pool; the work items inside a
//! group run sequentially on one worker.

use nexus_abi::{KernelArgs, KernelFn, WorkItem, ARG_BUFFER, ARG_SCALAR, KERNEL_OK};
use rayon::prelude::*;
use rayon::ThreadPool;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

use super::LaunchArg;
use crate::config::HostConfig;
use crate::properties::{keys, PropertyTable};
use crate::schedule::LaunchGeometry;
use crate::{NexusError, Result};

pub(crate) const HOST_RUNTIME_NAME: &str = "host";

/// 64-byte aligned so kernels can use aligned SIMD loads on any buffer.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct CacheLine([u8; 64]);

/// Zero-initialised, cache-line aligned host allocation.
pub(crate) struct HostMemory {
    lines: Vec<CacheLine>,
    len: usize,
}

impl HostMemory {
    pub fn zeroed(len: usize) -> Result<Self> {
        let count = len.div_ceil(64);
        let mut lines = Vec::new();
        lines.try_reserve_exact(count).map_err(|e| {
            NexusError::RuntimeFailure(format!("host allocation of {len} bytes failed: {e}"))
        })?;
        lines.resize(count, CacheLine([0; 64]));
        Ok(Self { lines, len })
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `lines` holds at least `len` initialised bytes.
        unsafe { std::slice::from_raw_parts(self.lines.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; the borrow is unique.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }

    /// Base pointer for kernel launches. Unlike [`as_bytes_mut`](Self::as_bytes_mut)
    /// this never materialises a reference to the contents.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.lines.as_mut_ptr().cast::<u8>()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// Argument block shared by every worker of one launch.
struct SharedArgs(KernelArgs);

// Kernels write bound buffers through raw pointers; the device queue lock is
// held for the whole launch so nothing else touches the memory.
unsafe impl Sync for SharedArgs {}

#[derive(Debug)]
struct KernelFault {
    group_id: u32,
    local_id: u32,
    status: i32,
}

pub(crate) struct HostBackend {
    pool: ThreadPool,
    threads: usize,
}

impl HostBackend {
    pub fn new(config: &HostConfig) -> Result<Self> {
        let threads = config
            .threads
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("nexus-host-{i}"))
            .build()
            .map_err(|e| NexusError::RuntimeFailure(format!("host worker pool: {e}")))?;
        tracing::debug!("host backend: {} worker threads", threads);
        Ok(Self { pool, threads })
    }

    pub fn name(&self) -> &str {
        HOST_RUNTIME_NAME
    }

    pub fn runtime_properties(&self) -> PropertyTable {
        let mut props = PropertyTable::new();
        props.insert(keys::NAME, HOST_RUNTIME_NAME);
        props.insert(keys::TYPE, "cpu");
        props.insert("threads", self.threads.to_string());
        props
    }

    pub fn device_properties(&self) -> PropertyTable {
        let mut props = PropertyTable::new();
        props.insert(keys::NAME, format!("{}-cpu", std::env::consts::ARCH));
        props.insert(keys::TYPE, "cpu");
        props.insert(keys::ARCHITECTURE, std::env::consts::ARCH);
        props.insert(keys::CORES, self.threads.to_string());

        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::new()),
        );
        if let Some(cpu) = sys.cpus().first().filter(|cpu| !cpu.vendor_id().is_empty()) {
            props.insert(keys::VENDOR, cpu.vendor_id());
        }
        if sys.total_memory() > 0 {
            props.insert(keys::MEMORY, sys.total_memory().to_string());
        }
        props
    }

    pub fn launch(
        &self,
        entry: KernelFn,
        args: &[LaunchArg],
        geometry: LaunchGeometry,
    ) -> Result<()> {
        let mut ptrs = Vec::with_capacity(args.len());
        let mut sizes = Vec::with_capacity(args.len());
        let mut kinds = Vec::with_capacity(args.len());
        let mut scalars = Vec::with_capacity(args.len());
        for arg in args {
            match *arg {
                LaunchArg::Host { ptr, len } => {
                    ptrs.push(ptr);
                    sizes.push(len);
                    kinds.push(ARG_BUFFER);
                    scalars.push(0);
                }
                LaunchArg::Scalar(cell) => {
                    ptrs.push(std::ptr::null_mut());
                    sizes.push(0);
                    kinds.push(ARG_SCALAR);
                    scalars.push(cell);
                }
                LaunchArg::Plugin(_) => {
                    return Err(NexusError::RuntimeFailure(
                        "plugin buffer bound to a host launch".into(),
                    ))
                }
            }
        }
        let shared = SharedArgs(KernelArgs {
            buffers: ptrs.as_ptr(),
            sizes: sizes.as_ptr(),
            kinds: kinds.as_ptr(),
            scalars: scalars.as_ptr(),
            count: ptrs.len() as u32,
        });
        let shared = &shared;
        let LaunchGeometry { grid_size, block_size } = geometry;

        let outcome = self.pool.install(|| {
            (0..grid_size).into_par_iter().try_for_each(|group_id| {
                for local_id in 0..block_size {
                    let item = WorkItem { group_id, local_id, grid_size, block_size };
                    let status = unsafe { entry(&shared.0, &item) };
                    if status != KERNEL_OK {
                        return Err(KernelFault { group_id, local_id, status });
                    }
                }
                Ok(())
            })
        });

        outcome.map_err(|fault| {
            NexusError::RuntimeFailure(format!(
                "kernel returned status {} at work item (group {}, local {})",
                fault.status, fault.group_id, fault.local_id
            ))
        })
    }
}
