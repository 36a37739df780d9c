use keel_dtype::DeviceSpec;
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The device could not provide the requested memory.
    #[snafu(display("allocation of {bytes} bytes on {device} failed: {reason}"))]
    AllocationFailed { device: DeviceSpec, bytes: usize, reason: String },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Failed to copy data between host and device or between two allocations.
    #[snafu(display("copy operation failed: {reason}"))]
    CopyFailed { reason: String },

    /// Invalid device specification.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    /// View range escapes the window of the buffer it was taken from.
    #[snafu(display("invalid view: range {start}..{end} exceeds window {window_start}..{window_end}"))]
    InvalidView { start: usize, end: usize, window_start: usize, window_end: usize },

    #[cfg(feature = "cuda")]
    /// CUDA-specific errors.
    #[snafu(display("CUDA error: {source}"))]
    CudaError { source: cudarc::driver::DriverError },
}
