use std::fmt;
use std::sync::{Arc, Weak};

use crate::device::{BufferSlot, DeviceShared};
use crate::dtype::{DataType, Element};
use crate::handle::{BufferId, DeviceId};
use crate::host::{HostRegion, HostRegionMut};
use crate::{NexusError, Result};

/// Largest allocation a single buffer may hold.
pub const MAX_BUFFER_BYTES: u64 = isize::MAX as u64;

/// Whether the host-visible view of a buffer reflects its device contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Device contents may differ from the last host transfer.
    Unsynced,
    /// Last host ↔ device transfer (or completed command) left both sides consistent.
    Synced,
}

/// Handle to a device-resident allocation.
///
/// The memory itself is owned by the device; this handle only names it. Clones
/// name the same allocation, so releasing through one clone invalidates all of
/// them.
#[derive(Clone)]
pub struct Buffer {
    id: BufferId,
    byte_size: u64,
    dtype: DataType,
    device_id: DeviceId,
    device: Weak<DeviceShared>,
}

pub(crate) fn validate_size(byte_size: u64) -> Result<()> {
    if byte_size == 0 {
        return Err(NexusError::InvalidArgument("buffer size must be positive".into()));
    }
    if byte_size > MAX_BUFFER_BYTES {
        return Err(NexusError::InvalidArgument(format!(
            "buffer size {byte_size} exceeds the {MAX_BUFFER_BYTES}-byte limit"
        )));
    }
    Ok(())
}

impl Buffer {
    pub(crate) fn new(
        id: BufferId,
        byte_size: u64,
        dtype: DataType,
        device: &Arc<DeviceShared>,
    ) -> Self {
        Self { id, byte_size, dtype, device_id: device.id(), device: Arc::downgrade(device) }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn device(&self) -> Result<Arc<DeviceShared>> {
        self.device.upgrade().ok_or_else(|| {
            NexusError::InvalidState(format!("{}: owning device has been torn down", self.id))
        })
    }

    /// Run `f` against this buffer's slot while holding the device queue.
    fn with_slot<R>(
        &self,
        f: impl FnOnce(&DeviceShared, &mut BufferSlot) -> Result<R>,
    ) -> Result<R> {
        let device = self.device()?;
        let mut queue = device.queue.lock();
        let slot = queue.slot_mut(self.id)?;
        f(&device, slot)
    }

    fn check_len(&self, len: u64, what: &str) -> Result<()> {
        if len != self.byte_size {
            return Err(NexusError::InvalidArgument(format!(
                "{what} is {len} bytes, {} is {} bytes",
                self.id, self.byte_size
            )));
        }
        Ok(())
    }

    /// Blocking device → host transfer into `dst`.
    ///
    /// Waits for any schedule running on the device before reading. The
    /// buffer is `Synced` afterwards.
    pub fn copy(&self, mut dst: HostRegionMut<'_>) -> Result<()> {
        self.with_slot(|device, slot| {
            self.check_len(dst.byte_size(), "destination")?;
            device.backend.read(device.index(), &slot.memory, dst.as_bytes_mut())?;
            slot.state = BufferState::Synced;
            Ok(())
        })
    }

    /// Host → device transfer from `src`. The buffer is `Synced` afterwards.
    pub fn write(&self, src: HostRegion<'_>) -> Result<()> {
        self.with_slot(|device, slot| {
            self.check_len(src.byte_size(), "source")?;
            device.backend.write(&mut slot.memory, src.as_bytes())?;
            slot.state = BufferState::Synced;
            Ok(())
        })
    }

    /// Repeat `pattern` over the whole buffer; an empty pattern zero-fills.
    pub fn fill(&self, pattern: &[u8]) -> Result<()> {
        let zero = [0u8];
        let pattern = if pattern.is_empty() { &zero[..] } else { pattern };
        let len = pattern.len() as u64;
        if len > self.byte_size || self.byte_size % len != 0 {
            return Err(NexusError::InvalidArgument(format!(
                "fill pattern of {len} bytes does not tile {} ({} bytes)",
                self.id, self.byte_size
            )));
        }
        self.with_slot(|device, slot| {
            device.backend.fill(&mut slot.memory, pattern)?;
            slot.state = BufferState::Synced;
            Ok(())
        })
    }

    /// Copy the whole buffer into a fresh byte vector.
    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.byte_size as usize];
        self.copy(HostRegionMut::new(&mut out, self.dtype))?;
        Ok(out)
    }

    /// Copy the whole buffer out as elements of `T`.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let elem = std::mem::size_of::<T>() as u64;
        if self.byte_size % elem != 0 {
            return Err(NexusError::InvalidArgument(format!(
                "{} ({} bytes) is not a whole number of {}",
                self.id,
                self.byte_size,
                T::DTYPE
            )));
        }
        let mut out = vec![T::zeroed(); (self.byte_size / elem) as usize];
        self.copy(HostRegionMut::of(&mut out))?;
        Ok(out)
    }

    pub fn state(&self) -> Result<BufferState> {
        self.with_slot(|_, slot| Ok(slot.state))
    }

    pub fn is_released(&self) -> bool {
        match self.device.upgrade() {
            Some(device) => !device.queue.lock().contains(self.id),
            None => true,
        }
    }

    /// Free the device memory. Any later use, including a second release, is
    /// `InvalidState`.
    pub fn release(&self) -> Result<()> {
        let device = self.device()?;
        let slot = device.queue.lock().remove(self.id)?;
        drop(slot);
        tracing::debug!("released {} ({} bytes) on {}", self.id, self.byte_size, self.device_id);
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("byte_size", &self.byte_size)
            .field("dtype", &self.dtype)
            .field("device", &self.device_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_size_limits() {
        assert_eq!(validate_size(0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            validate_size(MAX_BUFFER_BYTES + 1).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert!(validate_size(1).is_ok());
        assert!(validate_size(MAX_BUFFER_BYTES).is_ok());
    }
}
