use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaContext, CudaSlice};
use keel_dtype::DeviceSpec;
use snafu::ensure;
#[cfg(feature = "cuda")]
use snafu::ResultExt;

#[cfg(feature = "cuda")]
use crate::error::CudaSnafu;
use crate::error::{AllocationFailedSnafu, CopyFailedSnafu, Result, SizeMismatchSnafu};

/// Opaque handle to device memory.
///
/// Uses `RefCell` for interior mutability with runtime borrow checking.
/// Every operation takes byte offsets into the allocation.
#[derive(Debug)]
pub enum RawBuffer {
    Cpu {
        data: RefCell<Box<[u8]>>,
    },
    #[cfg(feature = "cuda")]
    Cuda {
        data: RefCell<CudaSlice<u8>>,
        device: Arc<CudaContext>,
    },
}

impl RawBuffer {
    /// Get the size of the buffer in bytes.
    pub fn size(&self) -> usize {
        match self {
            RawBuffer::Cpu { data } => data.borrow().len(),
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, .. } => data.borrow().len(),
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let size = self.size();
        let end = offset.saturating_add(len);
        ensure!(end <= size, SizeMismatchSnafu { expected: size, actual: end });
        Ok(())
    }

    /// Copy host bytes into the allocation at `offset`.
    pub fn copyin(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        tracing::trace!(offset, bytes = src.len(), "copyin");

        match self {
            RawBuffer::Cpu { data } => {
                data.borrow_mut()[offset..offset + src.len()].copy_from_slice(src);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, device } => {
                let mut cuda_data = data.borrow_mut();
                let mut view = cuda_data.slice_mut(offset..offset + src.len());
                device.default_stream().memcpy_htod(src, &mut view).context(CudaSnafu)
            }
        }
    }

    /// Copy bytes at `offset` out to host memory.
    pub fn copyout(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        tracing::trace!(offset, bytes = dst.len(), "copyout");

        match self {
            RawBuffer::Cpu { data } => {
                dst.copy_from_slice(&data.borrow()[offset..offset + dst.len()]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, device } => {
                let stream = device.default_stream();
                stream.synchronize().context(CudaSnafu)?;
                let cuda_data = data.borrow();
                let view = cuda_data.slice(offset..offset + dst.len());
                stream.memcpy_dtoh(&view, dst).context(CudaSnafu)
            }
        }
    }

    /// Copy `len` bytes between two regions of this allocation. Regions may overlap.
    pub fn copy_within(&self, dst_offset: usize, src_offset: usize, len: usize) -> Result<()> {
        self.check_range(dst_offset, len)?;
        self.check_range(src_offset, len)?;
        if len == 0 || dst_offset == src_offset {
            return Ok(());
        }
        tracing::trace!(dst_offset, src_offset, bytes = len, "copy within allocation");

        match self {
            RawBuffer::Cpu { data } => {
                data.borrow_mut().copy_within(src_offset..src_offset + len, dst_offset);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, device } => {
                // Source and destination cannot be borrowed from the same slice at once.
                let stream = device.default_stream();
                let mut staging = stream.alloc_zeros::<u8>(len).context(CudaSnafu)?;
                {
                    let cuda_data = data.borrow();
                    let src_view = cuda_data.slice(src_offset..src_offset + len);
                    stream.memcpy_dtod(&src_view, &mut staging).context(CudaSnafu)?;
                }
                let mut cuda_data = data.borrow_mut();
                let mut dst_view = cuda_data.slice_mut(dst_offset..dst_offset + len);
                stream.memcpy_dtod(&staging, &mut dst_view).context(CudaSnafu)
            }
        }
    }

    /// Copy `len` bytes from another allocation on the same device.
    pub fn copy_from(&self, dst_offset: usize, src: &RawBuffer, src_offset: usize, len: usize) -> Result<()> {
        if std::ptr::eq(self, src) {
            return self.copy_within(dst_offset, src_offset, len);
        }
        self.check_range(dst_offset, len)?;
        src.check_range(src_offset, len)?;
        tracing::trace!(dst_offset, src_offset, bytes = len, "copy between allocations");

        match (self, src) {
            (RawBuffer::Cpu { data: dst_data }, RawBuffer::Cpu { data: src_data }) => {
                let mut dst_mut = dst_data.borrow_mut();
                let src_ref = src_data.borrow();
                dst_mut[dst_offset..dst_offset + len].copy_from_slice(&src_ref[src_offset..src_offset + len]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            (RawBuffer::Cuda { data: dst_data, device }, RawBuffer::Cuda { data: src_data, .. }) => {
                let mut dst_cuda = dst_data.borrow_mut();
                let src_cuda = src_data.borrow();
                let mut dst_view = dst_cuda.slice_mut(dst_offset..dst_offset + len);
                let src_view = src_cuda.slice(src_offset..src_offset + len);
                device.default_stream().memcpy_dtod(&src_view, &mut dst_view).context(CudaSnafu)
            }
            #[cfg(feature = "cuda")]
            _ => CopyFailedSnafu { reason: "copies between different device kinds are not supported" }.fail(),
        }
    }

    /// Write `pattern` `count` times, back to back, starting at `offset`.
    pub fn fill(&self, offset: usize, pattern: &[u8], count: usize) -> Result<()> {
        let len = pattern.len().checked_mul(count).ok_or_else(|| {
            CopyFailedSnafu { reason: format!("fill of {count} x {} bytes overflows", pattern.len()) }.build()
        })?;
        self.check_range(offset, len)?;
        tracing::trace!(offset, count, element_bytes = pattern.len(), "fill");

        match self {
            RawBuffer::Cpu { data } => {
                let mut data_mut = data.borrow_mut();
                for chunk in data_mut[offset..offset + len].chunks_exact_mut(pattern.len().max(1)) {
                    chunk.copy_from_slice(pattern);
                }
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { .. } => {
                // Single host-to-device transfer of the expanded pattern.
                self.copyin(offset, &pattern.repeat(count))
            }
        }
    }

    /// Raw address of the byte at `offset`.
    ///
    /// For host-backed buffers this is a host pointer; for device buffers it is
    /// the device address, which must not be dereferenced on the host.
    pub fn address(&self, offset: usize) -> *mut u8 {
        match self {
            RawBuffer::Cpu { data } => data.borrow_mut().as_mut_ptr().wrapping_add(offset),
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, device } => {
                use cudarc::driver::DevicePtr;

                let stream = device.default_stream();
                let cuda_data = data.borrow();
                let (ptr, _record) = cuda_data.device_ptr(&stream);
                (ptr as usize).wrapping_add(offset) as *mut u8
            }
        }
    }
}

/// Options for buffer allocation.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// Whether to zero-initialize the buffer.
    pub zero_init: bool,
}

/// The device memory collaborator: hands out and takes back raw allocations.
pub trait Allocator: Send + Sync + std::fmt::Debug {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer>;
    fn free(&self, _buffer: RawBuffer) {}
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &str;
    fn device(&self) -> DeviceSpec;
}

/// CPU allocator using system memory.
#[derive(Debug, Clone)]
pub struct CpuAllocator;

impl Allocator for CpuAllocator {
    fn alloc(&self, size: usize, _options: &BufferOptions) -> Result<RawBuffer> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|e| {
            AllocationFailedSnafu { device: DeviceSpec::Cpu, bytes: size, reason: e.to_string() }.build()
        })?;
        data.resize(size, 0u8);
        Ok(RawBuffer::Cpu { data: RefCell::new(data.into_boxed_slice()) })
    }

    fn name(&self) -> &str {
        "CPU"
    }

    fn device(&self) -> DeviceSpec {
        DeviceSpec::Cpu
    }
}

/// CUDA allocator using GPU memory.
#[cfg(feature = "cuda")]
#[derive(Debug, Clone)]
pub struct CudaAllocator {
    device: Arc<CudaContext>,
    device_id: usize,
}

#[cfg(feature = "cuda")]
impl CudaAllocator {
    pub fn new(device_id: usize) -> Result<Self> {
        let device = CudaContext::new(device_id).context(CudaSnafu)?;
        Ok(Self { device, device_id })
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }
}

#[cfg(feature = "cuda")]
impl Allocator for CudaAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        let stream = self.device.default_stream();
        let data = if options.zero_init { stream.alloc_zeros::<u8>(size) } else { unsafe { stream.alloc::<u8>(size) } }
            .map_err(|e| {
                let device = DeviceSpec::Cuda { device_id: self.device_id };
                AllocationFailedSnafu { device, bytes: size, reason: e.to_string() }.build()
            })?;

        Ok(RawBuffer::Cuda { data: RefCell::new(data), device: Arc::clone(&self.device) })
    }

    fn synchronize(&self) -> Result<()> {
        self.device.default_stream().synchronize().context(CudaSnafu)
    }

    fn name(&self) -> &str {
        "CUDA"
    }

    fn device(&self) -> DeviceSpec {
        DeviceSpec::Cuda { device_id: self.device_id }
    }
}

/// Snapshot of a [`TrackingAllocator`]'s counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocStats {
    pub allocations: usize,
    pub deallocations: usize,
    pub live_bytes: usize,
}

impl AllocStats {
    /// Allocations not yet returned.
    pub fn live(&self) -> usize {
        self.allocations - self.deallocations
    }
}

/// Allocator wrapper that counts every allocation and release.
///
/// Used to observe that copy-on-write and view lifetimes neither leak nor
/// double-free device memory.
#[derive(Debug)]
pub struct TrackingAllocator {
    inner: Box<dyn Allocator>,
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    live_bytes: AtomicUsize,
    name: String,
}

impl TrackingAllocator {
    pub fn new(inner: Box<dyn Allocator>) -> Self {
        let name = format!("{} (tracked)", inner.name());
        Self {
            inner,
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            name,
        }
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            allocations: self.allocations.load(Ordering::Acquire),
            deallocations: self.deallocations.load(Ordering::Acquire),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
        }
    }
}

impl Allocator for TrackingAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        let buffer = self.inner.alloc(size, options)?;
        self.allocations.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(size, Ordering::AcqRel);
        Ok(buffer)
    }

    fn free(&self, buffer: RawBuffer) {
        self.deallocations.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(buffer.size(), Ordering::AcqRel);
        self.inner.free(buffer);
    }

    fn synchronize(&self) -> Result<()> {
        self.inner.synchronize()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn device(&self) -> DeviceSpec {
        self.inner.device()
    }
}
