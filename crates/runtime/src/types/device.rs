//! Device identifiers and construction-time device mapping

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::ModelError;

/// A single compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    /// Best available device: CUDA, then Metal, then CPU
    pub fn best_available() -> Self {
        if candle_core::utils::cuda_is_available() {
            DeviceSpec::Cuda(0)
        } else if candle_core::utils::metal_is_available() {
            DeviceSpec::Metal(0)
        } else {
            DeviceSpec::Cpu
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, DeviceSpec::Cpu)
    }

    /// Open the candle device this spec names
    pub fn open(&self) -> Result<Device, ModelError> {
        let device = match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(*ordinal),
            DeviceSpec::Metal(ordinal) => Device::new_metal(*ordinal),
        };
        device.map_err(|e| ModelError::DeviceUnavailable {
            device: self.to_string(),
            reason: e.to_string(),
        })
    }

    /// Default weight dtype: bf16 on accelerators, f32 on CPU
    pub fn default_dtype(&self) -> DType {
        match self {
            DeviceSpec::Cpu => DType::F32,
            DeviceSpec::Cuda(_) | DeviceSpec::Metal(_) => DType::BF16,
        }
    }
}

/// Same device `DeviceMapping::Auto` loads onto
impl Default for DeviceSpec {
    fn default() -> Self {
        DeviceSpec::best_available()
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DeviceSpec::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

/// Error returned when a device identifier cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid device identifier '{0}' (expected cpu, cuda[:N] or metal[:N])")]
pub struct ParseDeviceError(pub String);

impl FromStr for DeviceSpec {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match normalized.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| ParseDeviceError(s.to_string()))?;
                (kind, ordinal)
            }
            None => (normalized.as_str(), 0),
        };

        match kind {
            "cpu" if ordinal == 0 => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(ordinal)),
            "metal" | "mps" => Ok(DeviceSpec::Metal(ordinal)),
            _ => Err(ParseDeviceError(s.to_string())),
        }
    }
}

impl TryFrom<String> for DeviceSpec {
    type Error = ParseDeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceSpec> for String {
    fn from(value: DeviceSpec) -> Self {
        value.to_string()
    }
}

/// Construction-time placement request for the whole model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceMapping {
    /// Pick the best available device at load time
    #[default]
    Auto,
    /// No mapping requested; weights stay in host memory
    None,
    /// Pin the whole model to one device
    Device(DeviceSpec),
}

impl DeviceMapping {
    /// Device the weights land on when no offload session is involved
    pub fn resolve(&self) -> DeviceSpec {
        match self {
            DeviceMapping::Auto => DeviceSpec::best_available(),
            DeviceMapping::None => DeviceSpec::Cpu,
            DeviceMapping::Device(device) => *device,
        }
    }
}

impl fmt::Display for DeviceMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMapping::Auto => write!(f, "auto"),
            DeviceMapping::None => write!(f, "none"),
            DeviceMapping::Device(device) => write!(f, "{}", device),
        }
    }
}

impl FromStr for DeviceMapping {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DeviceMapping::Auto),
            "" | "none" => Ok(DeviceMapping::None),
            _ => s.parse().map(DeviceMapping::Device),
        }
    }
}

impl TryFrom<String> for DeviceMapping {
    type Error = ParseDeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceMapping> for String {
    fn from(value: DeviceMapping) -> Self {
        value.to_string()
    }
}
