use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

pub use keel_dtype::DeviceSpec;

use crate::allocator::{Allocator, CpuAllocator};
use crate::device::Device;
use crate::error::{InvalidDeviceSnafu, Result};

/// Environment variable selecting the default device, e.g. `CPU` or `CUDA:1`.
pub const DEVICE_ENV: &str = "KEEL_DEVICE";

/// Extension trait for DeviceSpec to add parsing functionality.
///
/// This is in the device crate because parsing depends on feature flags
/// and error types that are device-specific.
pub trait DeviceSpecExt: Sized {
    /// Parse a device string into a DeviceSpec.
    ///
    /// Examples:
    /// - "CPU" -> DeviceSpec::Cpu
    /// - "CUDA:0" -> DeviceSpec::Cuda { device_id: 0 }
    /// - "cuda" -> DeviceSpec::Cuda { device_id: 0 } (default to device 0)
    fn parse(s: &str) -> Result<Self>;

    /// Read [`DEVICE_ENV`], defaulting to the CPU when unset.
    fn from_env() -> Result<Self>;
}

impl DeviceSpecExt for DeviceSpec {
    fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_uppercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (s.as_str(), None),
        };

        match (kind, ordinal) {
            ("CPU", None) => Ok(DeviceSpec::Cpu),
            ("CUDA" | "GPU", None) => Ok(DeviceSpec::Cuda { device_id: 0 }),
            ("CUDA" | "GPU", Some(ordinal)) => {
                let device_id = ordinal.parse().map_err(|_| InvalidDeviceSnafu { device: s.clone() }.build())?;
                Ok(DeviceSpec::Cuda { device_id })
            }
            _ => InvalidDeviceSnafu { device: s.clone() }.fail(),
        }
    }

    fn from_env() -> Result<Self> {
        match std::env::var(DEVICE_ENV) {
            Ok(value) if !value.trim().is_empty() => <DeviceSpec as DeviceSpecExt>::parse(&value),
            _ => Ok(DeviceSpec::Cpu),
        }
    }
}

/// Process-wide cache of one allocator per device.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceSpec, Arc<dyn Allocator>>>,
}

impl DeviceRegistry {
    fn new() -> Self {
        Self { devices: RwLock::new(HashMap::new()) }
    }

    /// Get or create a device allocator.
    pub fn get(&self, spec: &DeviceSpec) -> Result<Arc<dyn Allocator>> {
        // Fast path: read lock
        {
            let devices = self.devices.read();
            if let Some(allocator) = devices.get(spec) {
                return Ok(Arc::clone(allocator));
            }
        }

        let mut devices = self.devices.write();

        // Double-check after acquiring write lock
        if let Some(allocator) = devices.get(spec) {
            return Ok(Arc::clone(allocator));
        }

        let allocator = self.create_allocator(spec)?;
        tracing::debug!(device = %spec, allocator = allocator.name(), "device allocator created");
        devices.insert(*spec, Arc::clone(&allocator));
        Ok(allocator)
    }

    /// Get a device by parsing a device string.
    pub fn get_device(&self, device: &str) -> Result<Device> {
        let spec = <DeviceSpec as DeviceSpecExt>::parse(device)?;
        Ok(Device::new(self.get(&spec)?))
    }

    fn create_allocator(&self, spec: &DeviceSpec) -> Result<Arc<dyn Allocator>> {
        match spec {
            DeviceSpec::Cpu => Ok(Arc::new(CpuAllocator)),
            #[cfg(feature = "cuda")]
            DeviceSpec::Cuda { device_id } => Ok(Arc::new(crate::allocator::CudaAllocator::new(*device_id)?)),
            #[cfg(not(feature = "cuda"))]
            DeviceSpec::Cuda { .. } => InvalidDeviceSnafu { device: format!("{spec} (built without `cuda` feature)") }.fail(),
        }
    }
}

/// Global device registry instance.
static REGISTRY: Lazy<DeviceRegistry> = Lazy::new(DeviceRegistry::new);

/// Get the global device registry.
pub fn registry() -> &'static DeviceRegistry {
    &REGISTRY
}

/// Convenience function to get a device by string.
pub fn get_device(device: &str) -> Result<Device> {
    registry().get_device(device)
}

/// Convenience function to get the CPU device.
pub fn cpu() -> Result<Device> {
    Ok(Device::new(registry().get(&DeviceSpec::Cpu)?))
}

/// Convenience function to get a CUDA device.
#[cfg(feature = "cuda")]
pub fn cuda(device_id: usize) -> Result<Device> {
    Ok(Device::new(registry().get(&DeviceSpec::Cuda { device_id })?))
}
