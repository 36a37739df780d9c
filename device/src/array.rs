//! Contiguous device arrays with zero-copy sub-range views.
//!
//! An [`ArrayBuffer`] is either a *root*, which owns its allocation, or a
//! *view*, which holds strong references to the buffer it was taken from and
//! to that buffer's root. Views never free memory; the root is released only
//! after its last view, so the allocation is returned exactly once.
//!
//! Array buffers are shared, not copy-on-write: a write through any handle or
//! view is visible through every other handle covering the same cells. Use
//! [`ArrayBuffer::deep_copy`] for an independent copy.
//!
//! ```text
//! root ──────────── Allocation [0, capacity) + element retainees
//!  ▲  ▲
//!  │  └── view(2..8) ── owner: root, root: root
//!  │        ▲
//!  └────────┴── view(1..3) ── owner: view(2..8), root: root
//! ```
//!
//! Element indices and ranges passed to the public API are relative to the
//! handle's own window; internally they are translated once to indices into
//! the root allocation.

use std::cell::RefCell;
use std::mem::size_of;
use std::ops::Range;
use std::rc::Rc;

use keel_dtype::{DeviceSpec, Element};
use smallvec::SmallVec;

use crate::allocator::BufferOptions;
use crate::device::{Allocation, Device};
use crate::error::{AllocationFailedSnafu, InvalidViewSnafu, Result};
use crate::pointer::{DevicePtr, DevicePtrMut};
use crate::retainer::HostRetainer;
use crate::scalar::{ScalarBuffer, ScalarValue};

/// One optional detached scalar per allocated cell, indexed like the allocation.
type Retainees<T> = RefCell<Vec<Option<Rc<ScalarBuffer<T>>>>>;

#[derive(Debug)]
enum Storage<T: Element> {
    Root { allocation: Allocation, retainees: Retainees<T> },
    View { root: ArrayBuffer<T>, owner: ArrayBuffer<T> },
}

#[derive(Debug)]
struct Node<T: Element> {
    storage: Storage<T>,
    capacity: usize,
    start: usize,
    end: usize,
    host_retainer: Option<Rc<HostRetainer<T>>>,
}

/// Shared handle to a contiguous run of device cells.
///
/// Cloning the handle shares the same buffer (and window); it copies nothing.
#[derive(Debug, Clone)]
pub struct ArrayBuffer<T: Element> {
    node: Rc<Node<T>>,
}

impl<T: Element> ArrayBuffer<T> {
    /// Allocate `capacity` zeroed cells on `device`.
    pub fn allocate(capacity: usize, device: &Device) -> Result<Self> {
        Self::allocate_with(capacity, device, &BufferOptions { zero_init: true })
    }

    pub fn allocate_with(capacity: usize, device: &Device, options: &BufferOptions) -> Result<Self> {
        Self::root(device, capacity, options, None)
    }

    /// Allocate and seed from host data with a single host-to-device copy.
    ///
    /// The host data is kept alive by a [`HostRetainer`] shared with every
    /// buffer derived from this one.
    pub fn from_host(elements: impl IntoIterator<Item = T>, device: &Device) -> Result<Self> {
        let retainer = Rc::new(HostRetainer::keep(elements.into_iter().collect()));
        let buffer = Self::root(device, retainer.len(), &BufferOptions::default(), Some(Rc::clone(&retainer)))?;
        buffer.ptr_mut(0).assign_from_host(retainer.as_slice())?;
        Ok(buffer)
    }

    /// Allocate `count` cells all holding `value`, filled in one device-side operation.
    pub fn repeating(value: T, count: usize, device: &Device) -> Result<Self> {
        let buffer = Self::root(device, count, &BufferOptions::default(), None)?;
        buffer.ptr_mut(0).assign_repeating(value, count)?;
        Ok(buffer)
    }

    /// Independent root holding a copy of this handle's window.
    ///
    /// One bulk device-to-device copy. The host retainer is shared rather than
    /// re-copied, and detached element retainees of the window carry over.
    pub fn deep_copy(&self) -> Result<Self> {
        let len = self.len();
        let host_retainer = self.node.host_retainer.clone();
        let copy = Self::root(self.allocation().device(), len, &BufferOptions::default(), host_retainer)?;
        copy.ptr_mut(0).assign_from_device(self.ptr(self.node.start), len)?;
        {
            let source = self.retainees().borrow();
            copy.retainees().borrow_mut().clone_from_slice(&source[self.node.start..self.node.end]);
        }
        tracing::debug!(dtype = %T::DTYPE, len, "array buffer deep copied");
        Ok(copy)
    }

    /// Zero-copy view of `range` within this handle's window.
    ///
    /// # Panics
    ///
    /// If `range` is not contained in `0..self.len()`. Nothing is read or
    /// written before the check.
    pub fn view(&self, range: Range<usize>) -> Self {
        let (start, end) = self.global_range(range);
        self.make_view(start, end)
    }

    /// Checked form of [`view`](Self::view).
    pub fn try_view(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.len() {
            return InvalidViewSnafu {
                start: self.node.start.saturating_add(range.start),
                end: self.node.start.saturating_add(range.end),
                window_start: self.node.start,
                window_end: self.node.end,
            }
            .fail();
        }
        Ok(self.make_view(self.node.start + range.start, self.node.start + range.end))
    }

    /// Number of visible cells.
    pub fn len(&self) -> usize {
        self.node.end - self.node.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total cells in the underlying allocation.
    pub fn capacity(&self) -> usize {
        self.node.capacity
    }

    /// First visible cell, as an index into the underlying allocation.
    pub fn start_index(&self) -> usize {
        self.node.start
    }

    /// One past the last visible cell, as an index into the underlying allocation.
    pub fn end_index(&self) -> usize {
        self.node.end
    }

    pub fn is_view(&self) -> bool {
        matches!(self.node.storage, Storage::View { .. })
    }

    /// The buffer this view was taken from; `None` for a root.
    pub fn owner(&self) -> Option<&ArrayBuffer<T>> {
        match &self.node.storage {
            Storage::Root { .. } => None,
            Storage::View { owner, .. } => Some(owner),
        }
    }

    /// Whether both handles address the same allocation.
    pub fn shares_allocation_with(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.root_node(), &other.root_node())
    }

    pub fn device(&self) -> DeviceSpec {
        self.allocation().device().spec()
    }

    pub fn host_retainer(&self) -> Option<&Rc<HostRetainer<T>>> {
        self.node.host_retainer.as_ref()
    }

    /// The detached scalar currently retained for cell `index`, if any.
    pub fn retainee(&self, index: usize) -> Option<Rc<ScalarBuffer<T>>> {
        let index = self.global_index(index);
        self.retainees().borrow()[index].clone()
    }

    pub fn get(&self, index: usize) -> Result<T> {
        self.ptr(self.global_index(index)).load()
    }

    /// One-cell view over `index`; reads and writes go straight to the shared cell.
    pub fn element(&self, index: usize) -> Self {
        let index = self.global_index(index);
        self.make_view(index, index + 1)
    }

    /// Detached copy of cell `index` as a standalone value.
    pub fn scalar_at(&self, index: usize) -> Result<ScalarValue<T>> {
        let index = self.global_index(index);
        let scalar = ScalarBuffer::allocate(self.allocation().device(), None)?;
        scalar.device_ptr_mut().assign_from_device(self.ptr(index), 1)?;
        Ok(ScalarValue::from_buffer(scalar))
    }

    /// Store `value` into cell `index`, dropping any detached scalar retained for it.
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        self.store(self.global_index(index), value)
    }

    /// Store a detached scalar into cell `index`.
    ///
    /// The array keeps its own reference to the scalar's buffer, so a later
    /// write through `value` copies on write instead of reaching the array.
    pub fn set_scalar(&self, index: usize, value: &ScalarValue<T>) -> Result<()> {
        let index = self.global_index(index);
        let buffer = Rc::clone(value.buffer());
        self.ptr_mut(index).assign_from_device(buffer.device_ptr(), 1)?;
        self.retainees().borrow_mut()[index] = Some(buffer);
        Ok(())
    }

    /// Overwrite `range` with the leading cells of `source`.
    ///
    /// Copies `min(range.len(), source.len())` cells in one device-to-device
    /// copy; destination cells past that count keep their contents. Retained
    /// scalars of the copied source cells are shared into the destination. Source and
    /// destination may overlap.
    ///
    /// # Panics
    ///
    /// If `range` is not contained in `0..self.len()`.
    pub fn replace_range(&self, range: Range<usize>, source: &ArrayBuffer<T>) -> Result<()> {
        let (start, end) = self.global_range(range);
        let count = (end - start).min(source.len());
        if count == 0 {
            return Ok(());
        }

        self.ptr_mut(start).assign_from_device(source.ptr(source.node.start), count)?;

        let moved: SmallVec<[Option<Rc<ScalarBuffer<T>>>; 8]> =
            source.retainees().borrow()[source.node.start..source.node.start + count].iter().cloned().collect();
        let mut slots = self.retainees().borrow_mut();
        for (slot, retainee) in slots[start..start + count].iter_mut().zip(moved) {
            *slot = retainee;
        }
        tracing::trace!(start, count, "range replaced from device buffer");
        Ok(())
    }

    /// Overwrite `range` element by element, pairing destination cells with
    /// `elements` until either runs out.
    ///
    /// # Panics
    ///
    /// If `range` is not contained in `0..self.len()`.
    pub fn replace_range_with(&self, range: Range<usize>, elements: impl IntoIterator<Item = T>) -> Result<()> {
        let (start, end) = self.global_range(range);
        for (index, element) in (start..end).zip(elements) {
            self.store(index, element)?;
        }
        Ok(())
    }

    /// Copy the visible window to host memory in one transfer.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut host = vec![T::zeroed(); self.len()];
        self.ptr(self.node.start).load_into(&mut host)?;
        Ok(host)
    }

    /// Run `f` with the address of the first visible cell.
    ///
    /// The allocation is kept alive for the duration of `f`, and the pointer
    /// cannot escape it.
    pub fn with_device_ptr<R>(&self, f: impl FnOnce(DevicePtr<'_, T>) -> R) -> R {
        f(self.ptr(self.node.start))
    }

    /// Run `f` with a writable address of the first visible cell.
    ///
    /// Writes land in the shared allocation like [`set`](Self::set), so the
    /// window's retained scalars are dropped first.
    pub fn with_device_ptr_mut<R>(&self, f: impl FnOnce(DevicePtrMut<'_, T>) -> R) -> R {
        self.retainees().borrow_mut()[self.node.start..self.node.end].fill(None);
        f(self.ptr_mut(self.node.start))
    }

    fn root(
        device: &Device,
        capacity: usize,
        options: &BufferOptions,
        host_retainer: Option<Rc<HostRetainer<T>>>,
    ) -> Result<Self> {
        let bytes = capacity.checked_mul(size_of::<T>()).ok_or_else(|| {
            let reason = format!("{capacity} cells overflow");
            AllocationFailedSnafu { device: device.spec(), bytes: usize::MAX, reason }.build()
        })?;
        let allocation = Allocation::new(device, bytes, options)?;
        let storage = Storage::Root { allocation, retainees: RefCell::new(vec![None; capacity]) };
        Ok(Self { node: Rc::new(Node { storage, capacity, start: 0, end: capacity, host_retainer }) })
    }

    fn make_view(&self, start: usize, end: usize) -> Self {
        debug_assert!(self.node.start <= start && end <= self.node.end);
        let root = match &self.node.storage {
            Storage::Root { .. } => self.clone(),
            Storage::View { root, .. } => root.clone(),
        };
        tracing::trace!(start, end, "array view created");
        let storage = Storage::View { root, owner: self.clone() };
        let node = Node {
            storage,
            capacity: self.node.capacity,
            start,
            end,
            host_retainer: self.node.host_retainer.clone(),
        };
        Self { node: Rc::new(node) }
    }

    fn base(&self) -> (&Allocation, &Retainees<T>) {
        match &self.node.storage {
            Storage::Root { allocation, retainees } => (allocation, retainees),
            Storage::View { root, .. } => root.base(),
        }
    }

    fn root_node(&self) -> Rc<Node<T>> {
        match &self.node.storage {
            Storage::Root { .. } => Rc::clone(&self.node),
            Storage::View { root, .. } => Rc::clone(&root.node),
        }
    }

    fn allocation(&self) -> &Allocation {
        self.base().0
    }

    fn retainees(&self) -> &Retainees<T> {
        self.base().1
    }

    /// Pointer to cell `index` of the root allocation.
    fn ptr(&self, index: usize) -> DevicePtr<'_, T> {
        DevicePtr::new(self.allocation(), index)
    }

    fn ptr_mut(&self, index: usize) -> DevicePtrMut<'_, T> {
        DevicePtrMut::new(self.allocation(), index)
    }

    fn store(&self, index: usize, value: T) -> Result<()> {
        self.ptr_mut(index).assign(value)?;
        self.retainees().borrow_mut()[index] = None;
        Ok(())
    }

    fn global_index(&self, index: usize) -> usize {
        let len = self.len();
        assert!(index < len, "index {index} out of bounds for array buffer of length {len}");
        self.node.start + index
    }

    fn global_range(&self, range: Range<usize>) -> (usize, usize) {
        let len = self.len();
        assert!(
            range.start <= range.end && range.end <= len,
            "range {}..{} out of bounds for array buffer of length {len}",
            range.start,
            range.end
        );
        (self.node.start + range.start, self.node.start + range.end)
    }
}
