//! Ordered command schedules.
//!
//! A [`Command`] binds a [`Kernel`] to buffers, scalars and a launch geometry.
//! It moves `Building → Finalized` through an explicit [`Command::finalize`]
//! and to `Completed` once a run of its schedule succeeds. Completed commands
//! stay runnable.
//!
//! [`Schedule::run`] validates the whole schedule before touching any device
//! state, then executes commands in insertion order under the device queue.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::backend::LaunchArg;
use crate::buffer::{Buffer, BufferState};
use crate::device::{DeviceQueue, DeviceShared};
use crate::handle::{CommandId, DeviceId, ScheduleId};
use crate::library::Kernel;
use crate::scalar::ScalarValue;
use crate::{NexusError, Result};

/// Work-group count and work-items per group of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchGeometry {
    pub grid_size: u32,
    pub block_size: u32,
}

impl LaunchGeometry {
    /// Total number of kernel invocations.
    pub fn work_items(&self) -> u64 {
        self.grid_size as u64 * self.block_size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandStatus {
    Building,
    Finalized,
    Completed,
}

/// What one argument slot is bound to.
#[derive(Clone)]
enum Binding {
    Buffer(Buffer),
    Scalar(ScalarValue),
}

#[derive(Clone)]
struct Launch {
    bindings: Vec<Binding>,
    geometry: LaunchGeometry,
}

impl Launch {
    fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.bindings.iter().filter_map(|binding| match binding {
            Binding::Buffer(buffer) => Some(buffer),
            Binding::Scalar(_) => None,
        })
    }
}

enum CommandPhase {
    Building { bindings: Vec<Option<Binding>> },
    Finalized(Launch),
    Completed(Launch),
}

impl CommandPhase {
    fn status(&self) -> CommandStatus {
        match self {
            CommandPhase::Building { .. } => CommandStatus::Building,
            CommandPhase::Finalized(_) => CommandStatus::Finalized,
            CommandPhase::Completed(_) => CommandStatus::Completed,
        }
    }

    fn launch(&self) -> Option<&Launch> {
        match self {
            CommandPhase::Finalized(launch) | CommandPhase::Completed(launch) => Some(launch),
            CommandPhase::Building { .. } => None,
        }
    }

    fn complete(&mut self) {
        let phase = std::mem::replace(self, CommandPhase::Building { bindings: Vec::new() });
        *self = match phase {
            CommandPhase::Finalized(launch) => CommandPhase::Completed(launch),
            other => other,
        };
    }
}

struct CommandSlot {
    id: CommandId,
    kernel: Kernel,
    phase: CommandPhase,
}

impl CommandSlot {
    fn mark(&self, queue: &mut DeviceQueue, state: BufferState) {
        if let Some(launch) = self.phase.launch() {
            for buffer in launch.buffers() {
                queue.set_state(buffer.id(), state);
            }
        }
    }
}

struct ScheduleInner {
    id: ScheduleId,
    device_id: DeviceId,
    device: Weak<DeviceShared>,
    commands: Mutex<Vec<CommandSlot>>,
}

impl ScheduleInner {
    fn device(&self) -> Result<Arc<DeviceShared>> {
        self.device.upgrade().ok_or_else(|| {
            NexusError::InvalidState(format!("{}: owning device has been torn down", self.id))
        })
    }
}

/// An ordered list of commands bound to one device.
pub struct Schedule {
    inner: Arc<ScheduleInner>,
}

impl Schedule {
    pub(crate) fn new(device: &Arc<DeviceShared>) -> Self {
        Self {
            inner: Arc::new(ScheduleInner {
                id: ScheduleId::next(),
                device_id: device.id(),
                device: Arc::downgrade(device),
                commands: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> ScheduleId {
        self.inner.id
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Append a `Building` command for `kernel`.
    ///
    /// `InvalidArgument` if the kernel was loaded on another device.
    pub fn create_command(&self, kernel: &Kernel) -> Result<Command> {
        self.inner.device()?;
        if kernel.device_id() != self.inner.device_id {
            return Err(NexusError::InvalidArgument(format!(
                "kernel '{}' belongs to {}, schedule {} targets {}",
                kernel.name(),
                kernel.device_id(),
                self.inner.id,
                self.inner.device_id
            )));
        }
        let mut commands = self.inner.commands.lock();
        let index = commands.len();
        let id = CommandId::next();
        commands.push(CommandSlot {
            id,
            kernel: kernel.clone(),
            phase: CommandPhase::Building {
                bindings: vec![None; kernel.slot_count() as usize],
            },
        });
        tracing::debug!(
            "{}: command {} ({}) for kernel '{}'",
            self.inner.id,
            index,
            id,
            kernel.name()
        );
        Ok(Command { schedule: Arc::downgrade(&self.inner), index, id, kernel: kernel.clone() })
    }

    pub fn len(&self) -> usize {
        self.inner.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The command at `index`, `NotFound` when out of range.
    pub fn command(&self, index: usize) -> Result<Command> {
        let commands = self.inner.commands.lock();
        let slot = commands.get(index).ok_or_else(|| {
            NexusError::NotFound(format!(
                "command {index} in {} ({} commands)",
                self.inner.id,
                commands.len()
            ))
        })?;
        Ok(Command {
            schedule: Arc::downgrade(&self.inner),
            index,
            id: slot.id,
            kernel: slot.kernel.clone(),
        })
    }

    /// Execute every command in insertion order and block until done.
    ///
    /// Fails with `InvalidState` before any side effect if a command is not
    /// finalized or a bound buffer has been released. Commands become
    /// `Completed` only once every command has run. A failing command aborts
    /// the run with [`NexusError::CommandFailed`] and no command changes
    /// status: buffers of earlier commands are `Synced`, buffers bound to the
    /// failing command and any later one are `Unsynced`.
    pub fn run(&self) -> Result<()> {
        let device = self.inner.device()?;
        let mut commands = self.inner.commands.lock();

        for (index, cmd) in commands.iter().enumerate() {
            if cmd.phase.launch().is_none() {
                return Err(NexusError::InvalidState(format!(
                    "{}: command {} ({}) is not finalized",
                    self.inner.id, index, cmd.id
                )));
            }
        }

        let mut queue = device.queue.lock();
        for (index, cmd) in commands.iter().enumerate() {
            for buffer in cmd.phase.launch().into_iter().flat_map(Launch::buffers) {
                if !queue.contains(buffer.id()) {
                    return Err(NexusError::InvalidState(format!(
                        "{}: command {} binds {}, which has been released",
                        self.inner.id,
                        index,
                        buffer.id()
                    )));
                }
            }
        }

        let started = Instant::now();
        for cmd in commands.iter() {
            cmd.mark(&mut queue, BufferState::Unsynced);
        }

        for index in 0..commands.len() {
            let cmd = &commands[index];
            let Some(launch) = cmd.phase.launch() else {
                continue;
            };
            let geometry = launch.geometry;
            let mut args = Vec::with_capacity(launch.bindings.len());
            for binding in &launch.bindings {
                args.push(match binding {
                    Binding::Buffer(buffer) => queue.slot_mut(buffer.id())?.memory.launch_arg(),
                    Binding::Scalar(value) => LaunchArg::Scalar(value.to_cell()),
                });
            }

            tracing::debug!(
                "{}: running command {} '{}' ({} x {})",
                self.inner.id,
                index,
                cmd.kernel.name(),
                geometry.grid_size,
                geometry.block_size
            );
            let launched =
                device.backend.launch(device.index(), cmd.kernel.entry(), &args, geometry);
            if let Err(e) = launched {
                for later in &commands[index..] {
                    later.mark(&mut queue, BufferState::Unsynced);
                }
                tracing::warn!(
                    "{}: command {} '{}' failed: {}",
                    self.inner.id,
                    index,
                    cmd.kernel.name(),
                    e
                );
                return Err(NexusError::CommandFailed {
                    index,
                    command: cmd.id,
                    kernel: cmd.kernel.name().to_string(),
                    reason: e.to_string(),
                });
            }

            cmd.mark(&mut queue, BufferState::Synced);
        }

        for cmd in commands.iter_mut() {
            cmd.phase.complete();
        }

        tracing::debug!(
            "{}: ran {} commands in {:.3}ms",
            self.inner.id,
            commands.len(),
            started.elapsed().as_secs_f64() * 1e3
        );
        Ok(())
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device_id)
            .field("commands", &self.len())
            .finish()
    }
}

/// Handle to one command inside a [`Schedule`].
#[derive(Clone)]
pub struct Command {
    schedule: Weak<ScheduleInner>,
    index: usize,
    id: CommandId,
    kernel: Kernel,
}

impl Command {
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Position in the owning schedule.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    fn with_slot<R>(
        &self,
        f: impl FnOnce(&ScheduleInner, &mut CommandSlot) -> Result<R>,
    ) -> Result<R> {
        let schedule = self.schedule.upgrade().ok_or_else(|| {
            NexusError::InvalidState(format!("{}: schedule has been dropped", self.id))
        })?;
        let mut commands = schedule.commands.lock();
        let slot = commands.get_mut(self.index).ok_or_else(|| {
            NexusError::InvalidState(format!("{}: no longer in its schedule", self.id))
        })?;
        f(&schedule, slot)
    }

    /// Bind `buffer` to `slot`. Rebinding a slot overwrites it.
    pub fn set_buffer(&self, slot: usize, buffer: &Buffer) -> Result<()> {
        self.bind(slot, Binding::Buffer(buffer.clone()))
    }

    /// Bind a by-value argument to `slot`. Rebinding a slot overwrites it,
    /// whether it held a buffer or a scalar.
    pub fn set_scalar(&self, slot: usize, value: impl Into<ScalarValue>) -> Result<()> {
        self.bind(slot, Binding::Scalar(value.into()))
    }

    fn bind(&self, slot: usize, binding: Binding) -> Result<()> {
        self.with_slot(|schedule, cmd| {
            let CommandPhase::Building { bindings } = &mut cmd.phase else {
                return Err(NexusError::InvalidState(format!(
                    "{}: cannot bind arguments once finalized",
                    self.id
                )));
            };
            if slot >= bindings.len() {
                return Err(NexusError::InvalidArgument(format!(
                    "slot {} out of range: kernel '{}' has {} slots",
                    slot,
                    self.kernel.name(),
                    bindings.len()
                )));
            }
            if let Binding::Buffer(buffer) = &binding {
                if buffer.device_id() != schedule.device_id {
                    return Err(NexusError::InvalidArgument(format!(
                        "{} lives on {}, command targets {}",
                        buffer.id(),
                        buffer.device_id(),
                        schedule.device_id
                    )));
                }
                if buffer.is_released() {
                    return Err(NexusError::InvalidState(format!(
                        "{} has been released",
                        buffer.id()
                    )));
                }
            }
            bindings[slot] = Some(binding);
            Ok(())
        })
    }

    /// Fix the launch geometry and move to `Finalized`.
    ///
    /// Checks, in order: the command is still `Building` (`InvalidState`),
    /// both sizes are positive (`InvalidArgument`), every slot is bound
    /// to a buffer or a scalar (`InvalidState`). The command is unchanged on
    /// any failure.
    pub fn finalize(&self, grid_size: u32, block_size: u32) -> Result<()> {
        self.with_slot(|_, cmd| {
            let CommandPhase::Building { bindings } = &cmd.phase else {
                return Err(NexusError::InvalidState(format!("{} is already finalized", self.id)));
            };
            if grid_size == 0 || block_size == 0 {
                return Err(NexusError::InvalidArgument(format!(
                    "launch geometry {grid_size} x {block_size} must be positive"
                )));
            }
            if let Some(unbound) = bindings.iter().position(Option::is_none) {
                return Err(NexusError::InvalidState(format!(
                    "{}: slot {} of kernel '{}' is unbound",
                    self.id,
                    unbound,
                    self.kernel.name()
                )));
            }
            let bindings = bindings.iter().flatten().cloned().collect();
            cmd.phase = CommandPhase::Finalized(Launch {
                bindings,
                geometry: LaunchGeometry { grid_size, block_size },
            });
            Ok(())
        })
    }

    pub fn status(&self) -> Result<CommandStatus> {
        self.with_slot(|_, cmd| Ok(cmd.phase.status()))
    }

    /// Launch geometry, once finalized.
    pub fn geometry(&self) -> Result<Option<LaunchGeometry>> {
        self.with_slot(|_, cmd| Ok(cmd.phase.launch().map(|l| l.geometry)))
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("kernel", &self.kernel.name())
            .finish()
    }
}
