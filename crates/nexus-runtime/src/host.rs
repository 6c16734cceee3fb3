//! Host memory descriptors crossing the runtime boundary.

use crate::dtype::{DataType, Element};

/// A read-only host memory region: contiguous bytes plus a data-type tag.
#[derive(Debug, Clone, Copy)]
pub struct HostRegion<'a> {
    bytes: &'a [u8],
    dtype: DataType,
}

impl<'a> HostRegion<'a> {
    pub fn new(bytes: &'a [u8], dtype: DataType) -> Self {
        Self { bytes, dtype }
    }

    /// Describe a typed slice; the tag comes from the element type.
    pub fn of<T: Element>(data: &'a [T]) -> Self {
        Self { bytes: bytemuck::cast_slice(data), dtype: T::DTYPE }
    }

    pub fn byte_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// A writable host memory region, the destination of a device read-back.
#[derive(Debug)]
pub struct HostRegionMut<'a> {
    bytes: &'a mut [u8],
    dtype: DataType,
}

impl<'a> HostRegionMut<'a> {
    pub fn new(bytes: &'a mut [u8], dtype: DataType) -> Self {
        Self { bytes, dtype }
    }

    pub fn of<T: Element>(data: &'a mut [T]) -> Self {
        Self { bytes: bytemuck::cast_slice_mut(data), dtype: T::DTYPE }
    }

    pub fn byte_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    /// Reborrow as a read-only region.
    pub fn as_region(&self) -> HostRegion<'_> {
        HostRegion { bytes: &*self.bytes, dtype: self.dtype }
    }
}
