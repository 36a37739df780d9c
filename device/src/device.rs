//! Device handles and per-thread device affinity.
//!
//! A [`Device`] pairs a [`DeviceSpec`] with the allocator that serves it. Every
//! buffer remembers the device it was allocated on; code that does not name a
//! device explicitly uses [`current_device`], which can be overridden for a
//! scope with [`with_device`].

use std::cell::RefCell;
use std::sync::Arc;

use keel_dtype::DeviceSpec;

use crate::allocator::{Allocator, BufferOptions, RawBuffer};
use crate::error::Result;
use crate::registry::{DeviceSpecExt, registry};

/// Handle to a device and its memory allocator.
#[derive(Debug, Clone)]
pub struct Device {
    spec: DeviceSpec,
    allocator: Arc<dyn Allocator>,
}

impl Device {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self { spec: allocator.device(), allocator }
    }

    /// Look the device up in the global registry.
    pub fn open(spec: DeviceSpec) -> Result<Self> {
        Ok(Self::new(registry().get(&spec)?))
    }

    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Wait for all outstanding work on the device.
    ///
    /// Buffer operations issue no synchronization of their own beyond what the
    /// allocator's copies imply; callers sharing memory with kernels on an
    /// asynchronous backend synchronize here.
    pub fn synchronize(&self) -> Result<()> {
        self.allocator.synchronize()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Device>> = const { RefCell::new(None) };
}

/// The device used by this thread when none is named.
///
/// Initialised lazily from `KEEL_DEVICE`.
pub fn current_device() -> Result<Device> {
    CURRENT.with(|current| {
        let existing = current.borrow().clone();
        if let Some(device) = existing {
            return Ok(device);
        }
        let device = Device::open(<DeviceSpec as DeviceSpecExt>::from_env()?)?;
        *current.borrow_mut() = Some(device.clone());
        Ok(device)
    })
}

/// Run `f` with `device` as this thread's current device.
///
/// The previous selection is restored when `f` returns or unwinds.
pub fn with_device<R>(device: &Device, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Device>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            CURRENT.with(|current| *current.borrow_mut() = previous);
        }
    }

    let previous = CURRENT.with(|current| current.replace(Some(device.clone())));
    let _restore = Restore(previous);
    f()
}

/// Exclusive owner of one raw allocation.
///
/// Returned to its allocator exactly once, on drop.
#[derive(Debug)]
pub(crate) struct Allocation {
    raw: Option<RawBuffer>,
    device: Device,
}

impl Allocation {
    pub(crate) fn new(device: &Device, size: usize, options: &BufferOptions) -> Result<Self> {
        let raw = device.allocator.alloc(size, options)?;
        tracing::trace!(device = %device.spec, bytes = size, "device memory allocated");
        Ok(Self { raw: Some(raw), device: device.clone() })
    }

    pub(crate) fn raw(&self) -> &RawBuffer {
        let Some(raw) = &self.raw else { unreachable!("device allocation used after release") };
        raw
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            tracing::trace!(device = %self.device.spec, bytes = raw.size(), "device memory released");
            self.device.allocator.free(raw);
        }
    }
}
