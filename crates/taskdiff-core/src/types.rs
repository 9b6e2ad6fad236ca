//! Common type definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Compute device that holds realized tensors.
///
/// Parsed from the strings accepted on the command line and in config files:
/// `cpu`, `cuda`, `cuda:N`, `mps`, `metal` and `metal:N`. `mps` is an alias
/// for the first Metal device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    /// Host memory.
    #[default]
    Cpu,
    /// CUDA device with the given ordinal.
    Cuda(usize),
    /// Metal device with the given ordinal (Apple Silicon).
    Metal(usize),
}

impl Device {
    /// Whether this device lives in host memory.
    #[must_use]
    pub const fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }
}

fn parse_ordinal(raw: &str, s: &str) -> Result<usize, CoreError> {
    raw.parse::<usize>()
        .map_err(|_| CoreError::InvalidDevice(s.to_string()))
}

impl FromStr for Device {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match normalized.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (normalized.as_str(), None),
        };

        match (kind, ordinal) {
            ("cpu", None) => Ok(Self::Cpu),
            ("cuda" | "gpu", None) => Ok(Self::Cuda(0)),
            ("cuda" | "gpu", Some(n)) => Ok(Self::Cuda(parse_ordinal(n, s)?)),
            ("mps" | "metal", None) => Ok(Self::Metal(0)),
            ("metal", Some(n)) => Ok(Self::Metal(parse_ordinal(n, s)?)),
            _ => Err(CoreError::InvalidDevice(s.to_string())),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!(" CPU ".parse::<Device>().unwrap(), Device::Cpu);
    }

    #[test]
    fn test_parse_cuda_ordinals() {
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(1));
    }

    #[test]
    fn test_mps_is_metal_alias() {
        assert_eq!("mps".parse::<Device>().unwrap(), Device::Metal(0));
        assert_eq!("metal:2".parse::<Device>().unwrap(), Device::Metal(2));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("cpu:0".parse::<Device>().is_err());
        assert!("mps:1".parse::<Device>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for device in [Device::Cpu, Device::Cuda(3), Device::Metal(0)] {
            assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
        }
    }

    #[test]
    fn test_serde_as_string() {
        let device: Device = serde_json::from_str("\"cuda:1\"").unwrap();
        assert_eq!(device, Device::Cuda(1));
        assert_eq!(serde_json::to_string(&Device::Cpu).unwrap(), "\"cpu\"");
        assert!(serde_json::from_str::<Device>("\"npu\"").is_err());
    }
}
