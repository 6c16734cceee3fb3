//! # nexus-runtime
//!
//! Heterogeneous-device compute runtime.
//!
//! Provides:
//! - Runtime discovery: a built-in host (CPU) backend plus vendor plugins
//!   loaded from `NEXUS_RUNTIME_PATH`
//! - Device-resident buffers with explicit host ↔ device transfers
//! - Kernel modules loaded per device and cached by path
//! - Ordered command schedules with buffer and scalar arguments, explicit
//!   finalize and blocking execution
//!
//! The flow is enumerate → allocate → bind → launch → read back:
//!
//! ```no_run
//! use nexus_runtime::{HostRegion, HostRegionMut, RuntimeRegistry};
//!
//! # fn main() -> nexus_runtime::Result<()> {
//! let runtime = RuntimeRegistry::global().runtime("host")?;
//! let device = runtime.device(0)?;
//!
//! let input = [1.0f32; 256];
//! let src = device.upload(&HostRegion::of(&input))?;
//! let dst = device.create_buffer(&HostRegion::of(&input))?;
//!
//! let library = device.load_library("./libnexus_kernels.so")?;
//! let kernel = library.get_kernel("copy_vector")?;
//!
//! let schedule = device.create_schedule();
//! let command = schedule.create_command(&kernel)?;
//! command.set_buffer(0, &src)?;
//! command.set_buffer(1, &dst)?;
//! command.finalize(4, 64)?;
//! schedule.run()?;
//!
//! let mut output = [0.0f32; 256];
//! dst.copy(HostRegionMut::of(&mut output))?;
//! # Ok(())
//! # }
//! ```

mod backend;
pub mod buffer;
pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod handle;
pub mod host;
pub mod library;
pub mod loader;
pub mod properties;
pub mod registry;
pub mod runtime;
pub mod scalar;
pub mod schedule;

pub use backend::RuntimeKind;
pub use buffer::{Buffer, BufferState, MAX_BUFFER_BYTES};
pub use config::{HostConfig, RegistryConfig};
pub use device::Device;
pub use dtype::{DataType, Element};
pub use error::{ErrorKind, NexusError};
pub use handle::{BufferId, CommandId, DeviceId, LibraryId, ScheduleId};
pub use host::{HostRegion, HostRegionMut};
pub use library::{Kernel, Library};
pub use properties::{DeviceDatabase, PropertyTable};
pub use registry::RuntimeRegistry;
pub use runtime::Runtime;
pub use scalar::ScalarValue;
pub use schedule::{Command, CommandStatus, LaunchGeometry, Schedule};

pub type Result<T> = std::result::Result<T, NexusError>;

/// Runtimes of the process-wide registry.
pub fn enumerate() -> Vec<Runtime> {
    RuntimeRegistry::global().enumerate()
}
