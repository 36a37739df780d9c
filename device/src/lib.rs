//! Copy-on-write value semantics over device memory.
//!
//! - [`ScalarValue`]: a single device-resident value; clones share storage
//!   until one of them is written.
//! - [`ArrayBuffer`]: a contiguous device allocation with zero-copy views.
//!   Views alias their root in place; [`ArrayBuffer::deep_copy`] detaches.
//! - [`Allocator`]: the device memory collaborator. [`CpuAllocator`] serves host
//!   memory, `CudaAllocator` (feature `cuda`) serves NVIDIA GPUs, and
//!   [`TrackingAllocator`] counts allocations for diagnostics.
//!
//! # Synchronization
//!
//! Every operation here is synchronous and issues no device synchronization of
//! its own. When kernels write to the same memory on an asynchronous backend,
//! call [`Device::synchronize`] before relying on a read observing them.
//!
//! All handles are `!Send + !Sync`; an allocation belongs to one thread.

pub mod allocator;
pub mod array;
pub mod device;
pub mod error;
pub mod pointer;
pub mod registry;
pub mod retainer;
pub mod scalar;


pub use allocator::{AllocStats, Allocator, BufferOptions, CpuAllocator, RawBuffer, TrackingAllocator};
#[cfg(feature = "cuda")]
pub use allocator::CudaAllocator;
pub use array::ArrayBuffer;
pub use device::{Device, current_device, with_device};
pub use error::{Error, Result};
pub use keel_dtype::{DeviceSpec, Element, ScalarDType};
pub use pointer::{DevicePtr, DevicePtrMut};
pub use registry::{DeviceSpecExt, cpu, get_device, registry};
pub use retainer::HostRetainer;
pub use scalar::{ScalarBuffer, ScalarValue};
