//! Shared helpers for the `siamese-light` example binaries.

use candle::{utils, Device, Result};

/// Picks the accelerator when one is compiled in and available, unless `cpu` is set.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        Ok(Device::Cpu)
    }
}
