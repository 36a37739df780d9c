//! Typed addresses into a device allocation.
//!
//! [`DevicePtr`] only reads. [`DevicePtrMut`] adds the stores and is handed
//! out only by accessors that own the right to write the cells it addresses.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;

use keel_dtype::{DeviceSpec, Element};

use crate::device::Allocation;
use crate::error::Result;

/// Read-only typed pointer to cell `index` of a device allocation.
///
/// The borrow of the allocation bounds the pointer's lifetime, so a
/// `DevicePtr` can never outlive the memory it addresses. All offsets are in
/// elements of `T`.
#[derive(Debug, Clone, Copy)]
pub struct DevicePtr<'a, T: Element> {
    allocation: &'a Allocation,
    index: usize,
    _marker: PhantomData<T>,
}

impl<'a, T: Element> DevicePtr<'a, T> {
    pub(crate) fn new(allocation: &'a Allocation, index: usize) -> Self {
        Self { allocation, index, _marker: PhantomData }
    }

    /// Pointer `by` cells further into the same allocation.
    pub fn advanced(self, by: usize) -> Self {
        Self { index: self.index + by, ..self }
    }

    /// Cell index within the allocation.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> DeviceSpec {
        self.allocation.device().spec()
    }

    /// Raw address for passing to lower-level device APIs.
    ///
    /// Valid only while this pointer's borrow is alive.
    pub fn address(&self) -> *const u8 {
        self.allocation.raw().address(self.byte_offset()).cast_const()
    }

    pub fn load(&self) -> Result<T> {
        let mut value = T::zeroed();
        self.allocation.raw().copyout(self.byte_offset(), bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Load `dst.len()` consecutive cells into host memory.
    pub fn load_into(&self, dst: &mut [T]) -> Result<()> {
        self.allocation.raw().copyout(self.byte_offset(), bytemuck::cast_slice_mut(dst))
    }

    fn byte_offset(&self) -> usize {
        self.index * size_of::<T>()
    }
}

/// Typed pointer that may also store into the cells it addresses.
///
/// Dereferences to [`DevicePtr`] for reads.
#[derive(Debug, Clone, Copy)]
pub struct DevicePtrMut<'a, T: Element> {
    ptr: DevicePtr<'a, T>,
}

impl<'a, T: Element> DevicePtrMut<'a, T> {
    pub(crate) fn new(allocation: &'a Allocation, index: usize) -> Self {
        Self { ptr: DevicePtr::new(allocation, index) }
    }

    pub fn advanced(self, by: usize) -> Self {
        Self { ptr: self.ptr.advanced(by) }
    }

    /// Read-only pointer to the same cell.
    pub fn as_ptr(&self) -> DevicePtr<'a, T> {
        self.ptr
    }

    pub fn address(&self) -> *mut u8 {
        self.ptr.allocation.raw().address(self.ptr.byte_offset())
    }

    pub fn assign(&self, value: T) -> Result<()> {
        self.ptr.allocation.raw().copyin(self.ptr.byte_offset(), bytemuck::bytes_of(&value))
    }

    /// Store `src.len()` consecutive cells from host memory.
    pub fn assign_from_host(&self, src: &[T]) -> Result<()> {
        self.ptr.allocation.raw().copyin(self.ptr.byte_offset(), bytemuck::cast_slice(src))
    }

    /// Device-to-device copy of `count` cells starting at `src`.
    pub fn assign_from_device(&self, src: DevicePtr<'_, T>, count: usize) -> Result<()> {
        self.ptr.allocation.raw().copy_from(
            self.ptr.byte_offset(),
            src.allocation.raw(),
            src.byte_offset(),
            count * size_of::<T>(),
        )
    }

    /// Store `value` into `count` consecutive cells.
    pub fn assign_repeating(&self, value: T, count: usize) -> Result<()> {
        self.ptr.allocation.raw().fill(self.ptr.byte_offset(), bytemuck::bytes_of(&value), count)
    }
}

impl<'a, T: Element> Deref for DevicePtrMut<'a, T> {
    type Target = DevicePtr<'a, T>;

    fn deref(&self) -> &Self::Target {
        &self.ptr
    }
}
