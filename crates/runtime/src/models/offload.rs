//! Host/accelerator offloading of the decoder weights
//!
//! An [`OffloadSession`] keeps every weight tensor in host memory. Before a
//! forward pass the session materializes the decoder on its execution device
//! ([`acquire`](OffloadSession::acquire)); afterwards it drops that copy
//! ([`release`](OffloadSession::release)) so the accelerator is free for the
//! diffusion pipeline between calls.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2::Config as QwenConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

use super::qwen::QwenModel;
use crate::types::{DeviceSpec, ModelError};

pub struct OffloadSession {
    config: QwenConfig,
    host_weights: HashMap<String, Tensor>,
    execution_device: DeviceSpec,
    dtype: DType,
    resident: Option<QwenModel>,
    acquisitions: u64,
}

impl OffloadSession {
    /// Read every shard into host memory and check it builds a decoder.
    pub fn load(
        config: QwenConfig,
        weights: &[PathBuf],
        execution_device: DeviceSpec,
        dtype: DType,
    ) -> Result<Self, ModelError> {
        let mut host_weights = HashMap::new();
        for shard in weights {
            host_weights.extend(candle_core::safetensors::load(shard, &Device::Cpu)?);
        }

        let session = Self {
            config,
            host_weights,
            execution_device,
            dtype,
            resident: None,
            acquisitions: 0,
        };
        session.validate()?;

        info!(
            tensors = session.host_weights.len(),
            execution_device = %execution_device,
            "Offload session attached"
        );
        Ok(session)
    }

    /// Build the decoder once on the host in the stored dtype; nothing is copied.
    fn validate(&self) -> Result<(), ModelError> {
        let host_dtype = self
            .host_weights
            .values()
            .next()
            .map(Tensor::dtype)
            .unwrap_or(DType::F32);
        let vb = VarBuilder::from_tensors(self.host_weights.clone(), host_dtype, &Device::Cpu);
        QwenModel::new(&self.config, vb)?;
        Ok(())
    }

    pub fn execution_device(&self) -> DeviceSpec {
        self.execution_device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_resident(&self) -> bool {
        self.resident.is_some()
    }

    /// Number of times weights were moved onto the execution device
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions
    }

    /// Prefetch weights onto the execution device.
    pub fn acquire(&mut self) -> Result<&mut QwenModel, ModelError> {
        if self.resident.is_none() {
            let device = self.execution_device.open()?;
            let vb = VarBuilder::from_tensors(self.host_weights.clone(), self.dtype, &device);
            self.resident = Some(QwenModel::new(&self.config, vb)?);
            self.acquisitions += 1;
            debug!(device = %self.execution_device, "Offloaded weights acquired");
        }
        self.resident
            .as_mut()
            .ok_or_else(|| ModelError::DeviceUnavailable {
                device: self.execution_device.to_string(),
                reason: "weights not resident".to_string(),
            })
    }

    /// Evict the device copy; host weights stay.
    pub fn release(&mut self) {
        if self.resident.take().is_some() {
            debug!(device = %self.execution_device, "Offloaded weights released");
        }
    }

    /// Run `f` with weights resident, releasing them whatever `f` returns.
    pub fn with_resident<T, E>(
        &mut self,
        f: impl FnOnce(&mut QwenModel) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<ModelError>,
    {
        let outcome = match self.acquire() {
            Ok(model) => f(model),
            Err(e) => Err(E::from(e)),
        };
        self.release();
        outcome
    }

    /// Point the session at a different execution device and drop any device copy.
    pub fn retarget(&mut self, device: DeviceSpec, dtype: DType) {
        self.release();
        self.execution_device = device;
        self.dtype = dtype;
    }
}
