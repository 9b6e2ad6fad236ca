//! Mapping of configured devices onto candle backends.

use taskdiff_core::Device;

use crate::{MergeError, Result};

/// Open the candle backend for a configured device.
///
/// GPU backends are only available when the crate is built with the `cuda`
/// or `metal` feature; otherwise opening one fails with [`MergeError::Device`].
pub fn open_device(device: Device) -> Result<candle_core::Device> {
    let opened = match device {
        Device::Cpu => Ok(candle_core::Device::Cpu),
        Device::Cuda(ordinal) => candle_core::Device::new_cuda(ordinal),
        Device::Metal(ordinal) => candle_core::Device::new_metal(ordinal),
    };

    opened.map_err(|source| MergeError::Device { device, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_cpu() {
        let device = open_device(Device::Cpu).unwrap();
        assert!(device.is_cpu());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_without_feature_is_device_error() {
        let err = open_device(Device::Cuda(0)).unwrap_err();
        assert!(matches!(err, MergeError::Device { .. }));
        assert!(err.to_string().contains("cuda:0"));
    }
}
