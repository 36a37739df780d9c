//! Single device-resident values.
//!
//! [`ScalarBuffer`] owns exactly one device cell. [`ScalarValue`] is the
//! user-facing copy-on-write handle: clones share one buffer, and the first
//! write through a shared handle moves that handle onto a private copy.

use std::marker::PhantomData;
use std::mem::size_of;
use std::rc::Rc;

use keel_dtype::{DeviceSpec, Element};

use crate::allocator::BufferOptions;
use crate::device::{Allocation, Device};
use crate::error::Result;
use crate::pointer::{DevicePtr, DevicePtrMut};

/// Exclusive owner of one device cell holding a `T`.
#[derive(Debug)]
pub struct ScalarBuffer<T: Element> {
    allocation: Allocation,
    _marker: PhantomData<T>,
}

impl<T: Element> ScalarBuffer<T> {
    /// Allocate one cell on `device`, storing `initial` if given.
    pub fn allocate(device: &Device, initial: Option<T>) -> Result<Self> {
        let options = BufferOptions { zero_init: initial.is_none() };
        let buffer = Self { allocation: Allocation::new(device, size_of::<T>(), &options)?, _marker: PhantomData };
        if let Some(value) = initial {
            buffer.store(value)?;
        }
        Ok(buffer)
    }

    /// New cell on the same device holding a device-side copy of this one.
    pub fn deep_copy(&self) -> Result<Self> {
        let copy = Self {
            allocation: Allocation::new(self.allocation.device(), size_of::<T>(), &BufferOptions::default())?,
            _marker: PhantomData,
        };
        copy.device_ptr_mut().assign_from_device(self.device_ptr(), 1)?;
        Ok(copy)
    }

    pub fn load(&self) -> Result<T> {
        self.device_ptr().load()
    }

    pub(crate) fn store(&self, value: T) -> Result<()> {
        self.device_ptr_mut().assign(value)
    }

    pub fn device(&self) -> DeviceSpec {
        self.allocation.device().spec()
    }

    pub fn device_ptr(&self) -> DevicePtr<'_, T> {
        DevicePtr::new(&self.allocation, 0)
    }

    /// Callers must hold the only reference to this buffer.
    pub(crate) fn device_ptr_mut(&self) -> DevicePtrMut<'_, T> {
        DevicePtrMut::new(&self.allocation, 0)
    }
}

/// Copy-on-write handle to a device-resident `T`.
///
/// Cloning is O(1) and moves no device memory. A write through a handle whose
/// buffer is shared first gives that handle a private copy, so no other
/// handle ever observes it.
#[derive(Debug, Clone)]
pub struct ScalarValue<T: Element> {
    buffer: Rc<ScalarBuffer<T>>,
}

impl<T: Element> ScalarValue<T> {
    pub fn new(device: &Device, value: T) -> Result<Self> {
        Ok(Self::from_buffer(ScalarBuffer::allocate(device, Some(value))?))
    }

    /// Zero-initialised value.
    pub fn zeroed(device: &Device) -> Result<Self> {
        Ok(Self::from_buffer(ScalarBuffer::allocate(device, None)?))
    }

    pub fn from_buffer(buffer: ScalarBuffer<T>) -> Self {
        Self { buffer: Rc::new(buffer) }
    }

    pub fn read(&self) -> Result<T> {
        self.buffer.load()
    }

    pub fn write(&mut self, value: T) -> Result<()> {
        self.make_unique()?;
        self.buffer.store(value)
    }

    /// Whether no other handle (or array slot) shares this buffer.
    pub fn is_unique(&self) -> bool {
        Rc::strong_count(&self.buffer) == 1
    }

    pub fn shares_buffer_with(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.buffer, &other.buffer)
    }

    pub fn device(&self) -> DeviceSpec {
        self.buffer.device()
    }

    /// Run `f` with the cell's device address for reading.
    ///
    /// The pointer has no stores, so a shared buffer stays shared:
    ///
    /// ```compile_fail
    /// # fn main() -> keel_device::Result<()> {
    /// let value = keel_device::ScalarValue::new(&keel_device::cpu()?, 1u32)?;
    /// value.with_device_ptr(|ptr| ptr.assign(99))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_device_ptr<R>(&self, f: impl FnOnce(DevicePtr<'_, T>) -> R) -> R {
        f(self.buffer.device_ptr())
    }

    /// Run `f` with the cell's device address for writing.
    ///
    /// The buffer is made unique first, so writes through the pointer stay private to this handle.
    pub fn with_device_ptr_mut<R>(&mut self, f: impl FnOnce(DevicePtrMut<'_, T>) -> R) -> Result<R> {
        self.make_unique()?;
        Ok(f(self.buffer.device_ptr_mut()))
    }

    pub(crate) fn buffer(&self) -> &Rc<ScalarBuffer<T>> {
        &self.buffer
    }

    fn make_unique(&mut self) -> Result<()> {
        if Rc::get_mut(&mut self.buffer).is_none() {
            tracing::debug!(
                dtype = %T::DTYPE,
                sharers = Rc::strong_count(&self.buffer),
                "scalar shared on write, copying"
            );
            self.buffer = Rc::new(self.buffer.deep_copy()?);
        }
        Ok(())
    }
}
