//! Core types shared across the runtime

pub mod device;
pub mod error;

pub use device::{DeviceMapping, DeviceSpec, ParseDeviceError};
pub use error::{FailureKind, ModelError, StageError};
